//! DigitalOcean compute provider.
//!
//! Instances are droplets named `bot-{id}`; data volumes are block storage
//! volumes named `bot-{id}-data`. Both names are deterministic, which is what
//! makes `create_instance` idempotent: before creating anything the provider
//! looks for resources that a previous delivery of the same job left behind.

mod client;
pub mod types;

use async_trait::async_trait;
use reqwest::Method;
use secrecy::SecretString;
use tracing::{error, info, warn};

pub use client::DigitalOceanClient;
use types::{
    Addresses, CreateDropletRequest, CreateVolumeRequest, DropletResponse, DropletsResponse,
    FirewallRequest, FirewallsResponse, InboundRule, OutboundRule, VolumeActionRequest,
    VolumeResponse, VolumesResponse,
};

use super::{
    AttachVolumeParams, ComputeProvider, CreateInstanceParams, DEFAULT_VOLUME_SIZE_GB,
    FirewallParams, GATEWAY_PORT, InstanceStatus, ProviderError, ProviderResources, Result,
};

const DROPLET_IMAGE: &str = "ubuntu-24-04-x64";

pub struct DigitalOceanProvider {
    client: DigitalOceanClient,
}

impl DigitalOceanProvider {
    pub fn new(token: SecretString) -> Result<Self> {
        Ok(Self {
            client: DigitalOceanClient::new(token)?,
        })
    }

    pub fn with_client(client: DigitalOceanClient) -> Self {
        Self { client }
    }

    fn droplet_name(bot_id: &str) -> String {
        format!("bot-{bot_id}")
    }

    fn volume_name(bot_id: &str) -> String {
        format!("bot-{bot_id}-data")
    }

    fn firewall_name(bot_id: &str) -> String {
        format!("bot-{bot_id}-fw")
    }

    async fn find_droplet(&self, bot_id: &str) -> Result<Option<types::Droplet>> {
        let path = format!("/droplets?tag_name=bot:{bot_id}&per_page=200");
        let resp: DropletsResponse = self.client.get(&path).await?;
        let name = Self::droplet_name(bot_id);
        Ok(resp.droplets.into_iter().find(|d| d.name == name))
    }

    async fn find_unattached_volume(&self, bot_id: &str, region: &str) -> Result<Option<String>> {
        let path = format!("/volumes?name={}&region={region}", Self::volume_name(bot_id));
        let resp: VolumesResponse = self.client.get(&path).await?;
        Ok(resp
            .volumes
            .into_iter()
            .find(|v| v.droplet_ids.is_empty())
            .map(|v| v.id))
    }

    async fn create_volume(&self, params: &CreateInstanceParams) -> Result<String> {
        let resp: VolumeResponse = self
            .client
            .post(
                "/volumes",
                &CreateVolumeRequest {
                    size_gigabytes: DEFAULT_VOLUME_SIZE_GB,
                    name: Self::volume_name(&params.bot_id),
                    region: params.region.clone(),
                    filesystem_type: "ext4".to_string(),
                    tags: params.tags.clone(),
                },
            )
            .await?;
        info!(volume_id = %resp.volume.id, bot_id = %params.bot_id, "Created volume");
        Ok(resp.volume.id)
    }

    async fn create_droplet(
        &self,
        params: &CreateInstanceParams,
        volume_id: &str,
    ) -> Result<ProviderResources> {
        let resp: DropletResponse = self
            .client
            .post(
                "/droplets",
                &CreateDropletRequest {
                    name: Self::droplet_name(&params.bot_id),
                    region: params.region.clone(),
                    size: params.size.clone(),
                    image: DROPLET_IMAGE.to_string(),
                    volumes: vec![volume_id.to_string()],
                    user_data: params.user_data.clone(),
                    tags: params.tags.clone(),
                    ssh_keys: Vec::new(),
                    monitoring: true,
                },
            )
            .await?;

        let droplet = resp.droplet;
        info!(instance_id = droplet.id, bot_id = %params.bot_id, "Created droplet");
        Ok(ProviderResources {
            instance_id: droplet.id.to_string(),
            volume_id: Some(volume_id.to_string()),
            ip_address: droplet.public_ipv4(),
        })
    }

    async fn find_firewall(&self, bot_id: &str) -> Result<Option<String>> {
        let resp: FirewallsResponse = self.client.get("/firewalls?per_page=200").await?;
        let name = Self::firewall_name(bot_id);
        Ok(resp.firewalls.into_iter().find(|f| f.name == name).map(|f| f.id))
    }
}

fn parse_droplet_id(instance_id: &str) -> Result<u64> {
    instance_id
        .parse()
        .map_err(|_| ProviderError::fatal(format!("invalid droplet id: {instance_id}")))
}

fn map_droplet_status(status: &str) -> InstanceStatus {
    match status {
        "new" => InstanceStatus::Creating,
        "active" => InstanceStatus::Active,
        "off" => InstanceStatus::Off,
        "archive" => InstanceStatus::Archive,
        _ => InstanceStatus::Error,
    }
}

/// Inbound TCP to the gateway port from each allowed address only. An empty
/// allow-list yields no inbound rules, which DigitalOcean treats as deny-all.
fn firewall_request(params: &FirewallParams, droplet_id: u64) -> FirewallRequest {
    let inbound_rules = params
        .allowed_inbound_ips
        .iter()
        .map(|ip| InboundRule {
            protocol: "tcp".to_string(),
            ports: GATEWAY_PORT.to_string(),
            sources: Addresses {
                addresses: vec![ip.clone()],
            },
        })
        .collect();

    let anywhere = || Addresses {
        addresses: vec!["0.0.0.0/0".to_string(), "::/0".to_string()],
    };
    let outbound_rules = vec![
        OutboundRule {
            protocol: "tcp".to_string(),
            ports: "443".to_string(),
            destinations: anywhere(),
        },
        OutboundRule {
            protocol: "tcp".to_string(),
            ports: "80".to_string(),
            destinations: anywhere(),
        },
        OutboundRule {
            protocol: "udp".to_string(),
            ports: "53".to_string(),
            destinations: anywhere(),
        },
    ];

    FirewallRequest {
        name: DigitalOceanProvider::firewall_name(&params.bot_id),
        inbound_rules,
        outbound_rules,
        droplet_ids: vec![droplet_id],
        tags: vec![format!("bot:{}", params.bot_id)],
    }
}

#[async_trait]
impl ComputeProvider for DigitalOceanProvider {
    fn name(&self) -> &'static str {
        "digitalocean"
    }

    fn volume_device_path(&self, bot_id: &str) -> String {
        format!("/dev/disk/by-id/scsi-0DO_Volume_{}", Self::volume_name(bot_id))
    }

    async fn create_instance(&self, params: &CreateInstanceParams) -> Result<ProviderResources> {
        if let Some(existing) = self.find_droplet(&params.bot_id).await? {
            info!(instance_id = existing.id, bot_id = %params.bot_id, "Droplet already exists");
            return Ok(ProviderResources {
                instance_id: existing.id.to_string(),
                volume_id: existing
                    .volume_ids
                    .first()
                    .cloned()
                    .or_else(|| params.volume_id.clone()),
                ip_address: existing.public_ipv4(),
            });
        }

        let (volume_id, created_volume) = match &params.volume_id {
            Some(id) => (id.clone(), false),
            None => match self
                .find_unattached_volume(&params.bot_id, &params.region)
                .await?
            {
                Some(id) => {
                    info!(volume_id = %id, bot_id = %params.bot_id, "Reusing leftover volume");
                    (id, false)
                }
                None => (self.create_volume(params).await?, true),
            },
        };

        match self.create_droplet(params, &volume_id).await {
            Ok(resources) => Ok(resources),
            Err(err) => {
                if created_volume {
                    error!(volume_id = %volume_id, error = %err, "Droplet creation failed, cleaning up volume");
                    if let Err(cleanup) = self.destroy_volume(&volume_id).await {
                        error!(
                            volume_id = %volume_id,
                            error = %cleanup,
                            "Failed to clean up volume after droplet failure"
                        );
                    }
                }
                Err(err)
            }
        }
    }

    async fn attach_volume(&self, params: &AttachVolumeParams) -> Result<String> {
        let droplet_id = parse_droplet_id(&params.instance_id)?;
        self.client
            .send_json(
                Method::POST,
                &format!("/volumes/{}/actions", params.volume_id),
                &VolumeActionRequest {
                    action_type: "attach".to_string(),
                    droplet_id,
                    region: params.region.clone(),
                },
            )
            .await?;
        Ok(params.volume_id.clone())
    }

    async fn configure_firewall(&self, params: &FirewallParams) -> Result<()> {
        let droplet_id = parse_droplet_id(&params.instance_id)?;
        let request = firewall_request(params, droplet_id);

        match self.find_firewall(&params.bot_id).await? {
            Some(id) => {
                self.client
                    .send_json(Method::PUT, &format!("/firewalls/{id}"), &request)
                    .await?;
                info!(firewall_id = %id, bot_id = %params.bot_id, "Updated firewall");
            }
            None => {
                self.client
                    .send_json(Method::POST, "/firewalls", &request)
                    .await?;
                info!(bot_id = %params.bot_id, rules = request.inbound_rules.len(), "Created firewall");
            }
        }
        Ok(())
    }

    async fn destroy_instance(&self, instance_id: &str) -> Result<()> {
        match self.client.delete(&format!("/droplets/{instance_id}")).await {
            Ok(()) => {
                info!(instance_id, "Destroyed droplet");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                warn!(instance_id, "Droplet already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn destroy_volume(&self, volume_id: &str) -> Result<()> {
        match self.client.delete(&format!("/volumes/{volume_id}")).await {
            Ok(()) => {
                info!(volume_id, "Destroyed volume");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                warn!(volume_id, "Volume already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn instance_status(&self, instance_id: &str) -> Result<InstanceStatus> {
        match self
            .client
            .get::<DropletResponse>(&format!("/droplets/{instance_id}"))
            .await
        {
            Ok(resp) => Ok(map_droplet_status(&resp.droplet.status)),
            Err(e) if e.is_not_found() => Ok(InstanceStatus::NotFound),
            Err(e) => Err(e),
        }
    }
}
