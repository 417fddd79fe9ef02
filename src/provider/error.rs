//! Tipos de erro para provedores de computação.
//!
//! Define [`ProviderError`] com duas classes de falha: transitórias
//! (redelivery com backoff) e permanentes (o bot vai para `error`). Usa
//! `thiserror` para derivar `Display` e `Error` a partir dos atributos
//! `#[error(...)]`.

use thiserror::Error;

/// Erros que um provedor pode devolver ao processador de jobs.
///
/// - [`Retryable`](ProviderError::Retryable): rate limit, 5xx, timeout, falha de rede
/// - [`Fatal`](ProviderError::Fatal): região inválida, cota excedida, demais 4xx
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Falha transitória; a fila deve reentregar o job.
    #[error("{message}")]
    Retryable { message: String },

    /// Falha permanente; reentregar não vai ajudar.
    /// `status` guarda o código HTTP quando a falha veio da API.
    #[error("{message}")]
    Fatal { message: String, status: Option<u16> },
}

impl ProviderError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable {
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
            status: None,
        }
    }

    /// Classifica uma resposta HTTP de erro: 429 e 5xx são transitórios,
    /// o resto é permanente.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if status == 429 || status >= 500 {
            Self::Retryable { message }
        } else {
            Self::Fatal {
                message,
                status: Some(status),
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }

    /// O recurso não existe (HTTP 404).
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Fatal { status: Some(404), .. })
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Self::retryable(format!("network error: {err}"))
        } else if let Some(status) = err.status() {
            Self::from_status(status.as_u16(), err.to_string())
        } else {
            Self::fatal(format!("invalid provider response: {err}"))
        }
    }
}
