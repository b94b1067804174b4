use serde::{Deserialize, Serialize};

/// Lifecycle state of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferState {
    /// Queued but not yet dispatched by the manager.
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "in_progress")]
    InProgress,
    #[serde(rename = "paused")]
    Paused,
    #[serde(rename = "complete")]
    Complete,
    /// Failed. May or may not be retryable.
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "canceled")]
    Canceled,
    /// The record no longer exists in the store.
    #[serde(rename = "deleted")]
    Deleted,
}

impl TransferState {
    /// Human readable label.
    pub fn label(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::InProgress => "In Progress",
            Self::Paused => "Paused",
            Self::Complete => "Complete",
            Self::Failed => "Failed",
            Self::Canceled => "Canceled",
            Self::Deleted => "Deleted",
        }
    }

    /// Terminal states accept no further chunk completions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Canceled | Self::Deleted)
    }

    /// States the manager will pick back up when it starts managing.
    pub fn is_resumable(self) -> bool {
        matches!(
            self,
            Self::Pending | Self::InProgress | Self::Paused | Self::Failed
        )
    }

    /// States an explicit pause applies to.
    pub fn is_pauseable(self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }

    /// States that take part in chunk dispatch.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }
}

impl std::fmt::Display for TransferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferType {
    Upload,
    Download,
}

impl std::fmt::Display for TransferType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Upload => f.write_str("upload"),
            Self::Download => f.write_str("download"),
        }
    }
}

/// Byte progress of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub bytes: u64,
    pub total_bytes: u64,
}

impl TransferProgress {
    pub fn new(bytes: u64, total_bytes: u64) -> Self {
        Self { bytes, total_bytes }
    }

    /// Progress in `[0.0, 1.0]`. An unknown or zero total reports 0.
    pub fn as_fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        if self.bytes >= self.total_bytes {
            return 1.0;
        }
        self.bytes as f64 / self.total_bytes as f64
    }

    /// Progress as a whole percentage (0-100).
    pub fn as_percent(&self) -> u8 {
        (self.as_fraction() * 100.0) as u8
    }
}

/// Network types a transfer policy can allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    WifiOrEthernet,
    Cellular,
}

/// Network status as reported by the reachability monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkStatus {
    #[default]
    Unknown,
    Disconnected,
    WifiOrEthernet,
    Cellular,
}

impl NetworkStatus {
    /// The usable network type, or `None` when there is no usable network.
    pub fn network_type(self) -> Option<NetworkType> {
        match self {
            Self::WifiOrEthernet => Some(NetworkType::WifiOrEthernet),
            Self::Cellular => Some(NetworkType::Cellular),
            Self::Unknown | Self::Disconnected => None,
        }
    }
}

/// Kind of remote blob. Only block blobs are transferable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobType {
    Block,
    Page,
    Append,
}

impl BlobType {
    /// Parses the `x-ms-blob-type` header value.
    pub fn from_header(value: &str) -> Option<Self> {
        match value {
            "BlockBlob" => Some(Self::Block),
            "PageBlob" => Some(Self::Page),
            "AppendBlob" => Some(Self::Append),
            _ => None,
        }
    }

    pub fn as_header(self) -> &'static str {
        match self {
            Self::Block => "BlockBlob",
            Self::Page => "PageBlob",
            Self::Append => "AppendBlob",
        }
    }
}
