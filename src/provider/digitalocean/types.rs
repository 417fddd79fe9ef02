//! Tipos de dados para requisições e respostas da API v2 da DigitalOcean.
//!
//! Cobrem apenas os campos que o provedor usa: droplets, volumes, ações de
//! volume e firewalls. Campos desconhecidos na resposta são ignorados.

use serde::{Deserialize, Serialize};

/// Corpo de `POST /volumes`.
#[derive(Debug, Clone, Serialize)]
pub struct CreateVolumeRequest {
    pub size_gigabytes: u32,
    pub name: String,
    pub region: String,
    pub filesystem_type: String,
    pub tags: Vec<String>,
}

/// Um volume de bloco.
#[derive(Debug, Clone, Deserialize)]
pub struct Volume {
    pub id: String,
    pub name: String,
    /// Droplets aos quais o volume está anexado (no máximo um).
    #[serde(default)]
    pub droplet_ids: Vec<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VolumeResponse {
    pub volume: Volume,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VolumesResponse {
    #[serde(default)]
    pub volumes: Vec<Volume>,
}

/// Corpo de `POST /volumes/{id}/actions` para anexar um volume.
#[derive(Debug, Clone, Serialize)]
pub struct VolumeActionRequest {
    /// Tipo da ação ("attach"). Serializado como "type" no JSON.
    #[serde(rename = "type")]
    pub action_type: String,
    pub droplet_id: u64,
    pub region: String,
}

/// Corpo de `POST /droplets`.
#[derive(Debug, Clone, Serialize)]
pub struct CreateDropletRequest {
    pub name: String,
    pub region: String,
    pub size: String,
    pub image: String,
    pub volumes: Vec<String>,
    /// Documento cloud-init renderizado, repassado sem interpretação.
    pub user_data: String,
    pub tags: Vec<String>,
    pub ssh_keys: Vec<String>,
    pub monitoring: bool,
}

/// Um droplet (instância de computação).
#[derive(Debug, Clone, Deserialize)]
pub struct Droplet {
    pub id: u64,
    pub name: String,
    /// Status nativo: "new", "active", "off" ou "archive".
    pub status: String,
    #[serde(default)]
    pub networks: Networks,
    #[serde(default)]
    pub volume_ids: Vec<String>,
}

impl Droplet {
    /// Primeiro IPv4 público, se a rede já foi atribuída.
    pub fn public_ipv4(&self) -> Option<String> {
        self.networks
            .v4
            .iter()
            .find(|n| n.network_type == "public")
            .map(|n| n.ip_address.clone())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Networks {
    #[serde(default)]
    pub v4: Vec<NetworkV4>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkV4 {
    pub ip_address: String,
    /// "public" ou "private". Serializado como "type" no JSON.
    #[serde(rename = "type")]
    pub network_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DropletResponse {
    pub droplet: Droplet,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DropletsResponse {
    #[serde(default)]
    pub droplets: Vec<Droplet>,
}

/// Lista de endereços usada como origem ou destino de uma regra.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Addresses {
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundRule {
    pub protocol: String,
    pub ports: String,
    pub sources: Addresses,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundRule {
    pub protocol: String,
    pub ports: String,
    pub destinations: Addresses,
}

/// Corpo de `POST /firewalls` e `PUT /firewalls/{id}`.
#[derive(Debug, Clone, Serialize)]
pub struct FirewallRequest {
    pub name: String,
    pub inbound_rules: Vec<InboundRule>,
    pub outbound_rules: Vec<OutboundRule>,
    pub droplet_ids: Vec<u64>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Firewall {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FirewallsResponse {
    #[serde(default)]
    pub firewalls: Vec<Firewall>,
}
