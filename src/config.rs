//! Configuração do botvisor carregada a partir de `botvisor.toml`.
//!
//! A struct [`EngineConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! Variáveis de ambiente têm precedência sobre o arquivo.

use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Nome do arquivo de configuração procurado no diretório atual.
pub const CONFIG_FILE: &str = "botvisor.toml";

/// Backend de computação usado pelo worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Provedor em memória, sem chamadas de rede.
    #[default]
    Fake,
    /// API v2 da DigitalOcean.
    DigitalOcean,
}

impl FromStr for ProviderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fake" => Ok(ProviderKind::Fake),
            "digitalocean" => Ok(ProviderKind::DigitalOcean),
            other => Err(ConfigError::UnknownProvider(other.to_string())),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Fake => f.write_str("fake"),
            ProviderKind::DigitalOcean => f.write_str("digitalocean"),
        }
    }
}

/// Configuração de nível superior do motor de ciclo de vida.
#[derive(Clone, Deserialize)]
pub struct EngineConfig {
    /// Chave mestra do codec de segredos (mínimo de 32 caracteres).
    #[serde(default)]
    pub master_key: String,

    /// IPs do proxy reverso da plataforma, separados por vírgula.
    /// Vazio significa negar todo tráfego de entrada.
    #[serde(default)]
    pub platform_proxy_ips: String,

    /// Backend de computação.
    #[serde(default)]
    pub provider: ProviderKind,

    /// Token da API DigitalOcean; obrigatório quando `provider = "digitalocean"`.
    #[serde(default)]
    pub digitalocean_token: String,

    /// Número de jobs processados em paralelo.
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// Intervalo entre health polls, em milissegundos.
    #[serde(default = "default_health_poll_interval_ms")]
    pub health_poll_interval_ms: u64,

    /// Versão da imagem do bot implantada nas instâncias.
    #[serde(default = "default_bot_version")]
    pub bot_version: String,

    /// Diretório onde o volume de dados é montado dentro da instância.
    #[serde(default = "default_mount_path")]
    pub mount_path: String,
}

// Valor padrão de concorrência: 5 workers.
fn default_worker_concurrency() -> usize {
    5
}

// Valor padrão do intervalo de health poll: 5 minutos.
fn default_health_poll_interval_ms() -> u64 {
    300_000
}

fn default_bot_version() -> String {
    "latest".to_string()
}

fn default_mount_path() -> String {
    "/data".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            master_key: String::new(),
            platform_proxy_ips: String::new(),
            provider: ProviderKind::default(),
            digitalocean_token: String::new(),
            worker_concurrency: default_worker_concurrency(),
            health_poll_interval_ms: default_health_poll_interval_ms(),
            bot_version: default_bot_version(),
            mount_path: default_mount_path(),
        }
    }
}

// Segredos nunca aparecem em logs.
impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |s: &str| if s.is_empty() { "" } else { "[REDACTED]" };
        f.debug_struct("EngineConfig")
            .field("master_key", &redact(&self.master_key))
            .field("platform_proxy_ips", &self.platform_proxy_ips)
            .field("provider", &self.provider)
            .field("digitalocean_token", &redact(&self.digitalocean_token))
            .field("worker_concurrency", &self.worker_concurrency)
            .field("health_poll_interval_ms", &self.health_poll_interval_ms)
            .field("bot_version", &self.bot_version)
            .field("mount_path", &self.mount_path)
            .finish()
    }
}

impl EngineConfig {
    /// Carrega a configuração de `botvisor.toml` no diretório atual e aplica
    /// as variáveis de ambiente do processo.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Path::new(CONFIG_FILE), |name| std::env::var(name).ok())
    }

    /// Carrega a configuração de `path` (se existir) e aplica `env` por cima.
    pub fn load_from(
        path: &Path,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<EngineConfig>(&contents)?
        } else {
            Self::default()
        };

        // Variáveis de ambiente vazias são ignoradas.
        let var = |name: &str| env(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("SECRETS_MASTER_KEY") {
            config.master_key = v;
        }
        if let Some(v) = var("PLATFORM_PROXY_IPS") {
            config.platform_proxy_ips = v;
        }
        if let Some(v) = var("PROVIDER") {
            config.provider = v.parse()?;
        }
        if let Some(v) = var("DIGITALOCEAN_API_TOKEN") {
            config.digitalocean_token = v;
        }
        if let Some(v) = var("WORKER_CONCURRENCY") {
            config.worker_concurrency = parse_number("WORKER_CONCURRENCY", &v)?;
        }
        if let Some(v) = var("HEALTH_POLL_INTERVAL_MS") {
            config.health_poll_interval_ms = parse_number("HEALTH_POLL_INTERVAL_MS", &v)?;
        }
        if let Some(v) = var("BOT_VERSION") {
            config.bot_version = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Verifica combinações inválidas depois do merge.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                name: "worker_concurrency",
                value: "0".to_string(),
            });
        }
        if self.provider == ProviderKind::DigitalOcean && self.digitalocean_token.is_empty() {
            return Err(ConfigError::MissingProviderToken);
        }
        Ok(())
    }

    /// Lista de IPs liberados no firewall: entradas separadas por vírgula,
    /// sem espaços, descartando entradas vazias.
    pub fn allowed_inbound_ips(&self) -> Vec<String> {
        self.platform_proxy_ips
            .split(',')
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
            .map(String::from)
            .collect()
    }

    pub fn health_poll_interval(&self) -> Duration {
        Duration::from_millis(self.health_poll_interval_ms)
    }

    pub fn master_key(&self) -> SecretString {
        SecretString::from(self.master_key.clone())
    }

    pub fn digitalocean_token(&self) -> SecretString {
        SecretString::from(self.digitalocean_token.clone())
    }
}

fn parse_number<T: FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        name,
        value: value.to_string(),
    })
}
