use tether_link::LinkError;
use tether_relay::RelayError;

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Relay(#[from] RelayError),

    #[error("{0}")]
    Link(#[from] LinkError),

    #[error("{0}")]
    Settings(#[from] tether_settings::SettingsError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl CliError {
    /// Process exit status, following the sysexits.h conventions.
    pub fn exit_code(&self) -> i32 {
        match self {
            // EX_CONFIG
            CliError::Settings(_) => 78,
            CliError::Relay(RelayError::InvalidProtocol(_)) => 78,
            // EX_TEMPFAIL: the listen port is taken, retrying later may work.
            CliError::Relay(RelayError::Bind { .. })
            | CliError::Link(LinkError::Relay(RelayError::Bind { .. })) => 75,
            CliError::Relay(_) | CliError::Link(LinkError::Relay(_)) => 70,
            // EX_UNAVAILABLE: adb or the device.
            CliError::Link(_) => 69,
            CliError::Io(_) => 74,
            CliError::Other(_) => 1,
        }
    }
}
