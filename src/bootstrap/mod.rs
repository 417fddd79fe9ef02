//! Bootstrap documents handed to a new instance as user-data.
//!
//! Three documents are rendered from compiled-in templates: the cloud-init
//! boot loader, the compose manifest for the bot container, and a health
//! check script. The boot loader embeds the other two as `write_files`
//! entries, so it is the only document a provider ever sees.
//!
//! Every tenant-controlled value lands inside a YAML double-quoted scalar and
//! is escaped on the way in; see [`escape_yaml_double_quoted`].

mod template;

use std::borrow::Cow;

use secrecy::{ExposeSecret, SecretString};

use crate::error::RenderError;
use template::Value;

pub use template::escape_yaml_double_quoted;

const CLOUD_INIT_TEMPLATE: &str = include_str!("../../templates/cloud-init.yaml");
const COMPOSE_TEMPLATE: &str = include_str!("../../templates/docker-compose.yml");
const HEALTH_CHECK_SCRIPT: &str = include_str!("../../templates/health-check.sh");

/// Indentation of `write_files[*].content` literal blocks in the boot loader.
const WRITE_FILES_INDENT: usize = 6;

/// Everything needed to render the bootstrap documents for one bot.
///
/// Decrypted secrets stay wrapped in [`SecretString`] until the moment
/// they are written into the rendered text.
#[derive(Debug, Clone)]
pub struct BootstrapParams {
    pub bot_id: String,
    pub gateway_token: SecretString,
    pub version: String,
    pub model_provider_key: Option<SecretString>,
    pub model_provider: Option<String>,
    pub system_instructions: Option<String>,
    /// Block device the data volume appears as inside the instance.
    pub volume_device: String,
    /// Host directory the data volume is mounted at.
    pub mount_path: String,
}

impl BootstrapParams {
    pub fn validate(&self) -> Result<(), RenderError> {
        if self.bot_id.is_empty()
            || !self
                .bot_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(invalid("bot_id", "must be non-empty [A-Za-z0-9_-]"));
        }
        if self.gateway_token.expose_secret().is_empty() {
            return Err(invalid("gateway_token", "must not be empty"));
        }
        if self.version.trim().is_empty() {
            return Err(invalid("version", "must not be empty"));
        }
        if !self.volume_device.starts_with('/') {
            return Err(invalid("volume_device", "must be an absolute path"));
        }
        if !self.mount_path.starts_with('/') {
            return Err(invalid("mount_path", "must be an absolute path"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> RenderError {
    RenderError::InvalidParam {
        field,
        reason: reason.to_string(),
    }
}

/// Render the cloud-init document passed to the provider as user-data.
pub fn render_boot_loader(params: &BootstrapParams) -> Result<String, RenderError> {
    let compose = render_compose_manifest(params)?;
    let health = render_health_check_script();

    template::render(
        "cloud-init.yaml",
        CLOUD_INIT_TEMPLATE,
        &[
            ("VOLUME_DEVICE", Value::Quoted(&params.volume_device)),
            ("MOUNT_PATH", Value::Quoted(&params.mount_path)),
            ("COMPOSE_MANIFEST", Value::Block(&compose, WRITE_FILES_INDENT)),
            ("HEALTH_CHECK_SCRIPT", Value::Block(&health, WRITE_FILES_INDENT)),
        ],
    )
}

/// Render the compose manifest that runs the bot container.
pub fn render_compose_manifest(params: &BootstrapParams) -> Result<String, RenderError> {
    params.validate()?;

    let model_provider_key = params
        .model_provider_key
        .as_ref()
        .map(|k| k.expose_secret())
        .unwrap_or_default();

    let bot_id = escape_compose_interpolation(&params.bot_id);
    let version = escape_compose_interpolation(&params.version);
    let gateway_token = escape_compose_interpolation(params.gateway_token.expose_secret());
    let model_provider =
        escape_compose_interpolation(params.model_provider.as_deref().unwrap_or_default());
    let model_provider_key = escape_compose_interpolation(model_provider_key);
    let system_instructions =
        escape_compose_interpolation(params.system_instructions.as_deref().unwrap_or_default());
    let mount_path = escape_compose_interpolation(&params.mount_path);

    template::render(
        "docker-compose.yml",
        COMPOSE_TEMPLATE,
        &[
            ("BOT_ID", Value::Quoted(&bot_id)),
            ("VERSION", Value::Quoted(&version)),
            ("GATEWAY_TOKEN", Value::Quoted(&gateway_token)),
            ("MODEL_PROVIDER", Value::Quoted(&model_provider)),
            ("MODEL_PROVIDER_KEY", Value::Quoted(&model_provider_key)),
            ("SYSTEM_INSTRUCTIONS", Value::Quoted(&system_instructions)),
            ("MOUNT_PATH", Value::Quoted(&mount_path)),
        ],
    )
}

/// Compose expands `$VAR` inside values; `$$` is a literal dollar sign.
pub fn escape_compose_interpolation(value: &str) -> Cow<'_, str> {
    if value.contains('$') {
        Cow::Owned(value.replace('$', "$$"))
    } else {
        Cow::Borrowed(value)
    }
}

/// The health check script. It takes no parameters.
pub fn render_health_check_script() -> String {
    HEALTH_CHECK_SCRIPT.to_string()
}
