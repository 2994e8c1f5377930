pub mod classify;
pub mod interceptor;
mod server;
pub mod tls;

// Re-export common types
pub use classify::{classify, Initiator, ResourceType};
pub use interceptor::{CapturedRequest, CapturedResponse, Interceptor};
pub use tls::CertificateAuthority;

#[derive(Debug, thiserror::Error)]
pub enum InterceptorError {
    #[error("interceptor could not bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("interceptor server failed: {0}")]
    Server(String),

    #[error("interceptor TLS setup failed: {0}")]
    Tls(String),

    #[error("no interceptor is running for this session")]
    NotRunning,
}
