//! Process configuration, loaded once at startup from an XML document.
//!
//! One section per process under a single root:
//!
//! ```xml
//! <Exchange>
//!   <Gateway>
//!     <Port>9000</Port>
//!     <BlockingQueue><Size>1024</Size></BlockingQueue>
//!     <Fix><MaxEventSize>64</MaxEventSize><BacklogSize>10</BacklogSize></Fix>
//!     <Ipc><QueueName>gateway_to_sequencer</QueueName></Ipc>
//!   </Gateway>
//!   <Sequencer>
//!     <Ipc><QueueName>gateway_to_sequencer</QueueName></Ipc>
//!   </Sequencer>
//! </Exchange>
//! ```
//!
//! The parsed value is immutable; each component receives a reference at
//! construction instead of consulting a global.

use std::path::Path;

use serde::Deserialize;

/// Failures loading or parsing the configuration document.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file `{path}`: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config file `{path}`: {source}")]
    Parse {
        path: String,
        source: quick_xml::DeError,
    },
}

/// The whole document: one section per process.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Config {
    pub gateway: GatewayConfig,
    pub sequencer: SequencerConfig,
}

/// `<Gateway>` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GatewayConfig {
    /// TCP listen port.
    pub port: u16,
    pub blocking_queue: BlockingQueueConfig,
    pub fix: FixConfig,
    pub ipc: IpcConfig,
}

/// `<BlockingQueue>` subsection: ingress queue sizing.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BlockingQueueConfig {
    /// Ingress queue capacity.
    pub size: usize,
}

/// `<Fix>` subsection: listener event-loop sizing.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FixConfig {
    /// epoll event array size.
    pub max_event_size: usize,
    /// Listen backlog.
    pub backlog_size: u32,
}

/// `<Ipc>` subsection: downstream queue naming.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IpcConfig {
    /// Logical name of the shared-memory queue to the next stage.
    pub queue_name: String,
}

/// `<Sequencer>` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SequencerConfig {
    pub ipc: IpcConfig,
}

impl Config {
    /// Parses a configuration document from a string.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError::Parse`] describing the offending element.
    pub fn from_str(xml: &str) -> Result<Self, ConfigError> {
        quick_xml::de::from_str(xml).map_err(|source| ConfigError::Parse {
            path: "<inline>".to_string(),
            source,
        })
    }

    /// Reads and parses the document at `path`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] when the file cannot be read,
    /// [`ConfigError::Parse`] when it is not a valid config document.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let xml = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        quick_xml::de::from_str(&xml).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}
