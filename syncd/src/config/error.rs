//! Configuration errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("toml parse error in \"{path}\": {source}")]
    Toml {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid appID \"{0}\": must match ^[a-z0-9_]+$")]
    InvalidAppId(String),

    #[error("publication name \"{0}\" is reserved (starts with '_')")]
    ReservedPublicationName(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn config(contents: &str, source: toml::de::Error) -> Self {
        let _ = contents;
        Error::Toml {
            path: "syncd.toml".to_string(),
            source,
        }
    }
}
