use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Invalid message: {message}"))]
    Validation { message: String },

    #[snafu(display("Queue is full ({capacity} messages)"))]
    QueueFull { capacity: usize },

    #[snafu(display("Backend operation `{operation}` on `{target}` failed: {message}"))]
    Backend {
        operation: &'static str,
        target: String,
        message: String,
    },

    #[snafu(display("Error returned from database"))]
    Database {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Error running migrations"))]
    Migration {
        #[snafu(source)]
        source: sqlx::migrate::MigrateError,
    },

    #[snafu(display("Serialization error"))]
    Serialization {
        #[snafu(source)]
        source: serde_json::Error,
    },

    #[snafu(display("Circuit open for {context}"))]
    CircuitOpen { context: String },

    #[snafu(display("Delivery of {message_id} exhausted {attempts} attempts"))]
    DeliveryExhausted { message_id: String, attempts: u32 },

    #[snafu(display("Recovery failed: {message}"))]
    Recovery { message: String },

    #[snafu(display("Internal error"))]
    Internal {
        #[snafu(source(false))]
        source: Option<eyre::Report>,
    },
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        Self::Database { source }
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(source: sqlx::migrate::MigrateError) -> Self {
        Self::Migration { source }
    }
}

impl From<serde_json::Error> for Error {
    fn from(source: serde_json::Error) -> Self {
        Self::Serialization { source }
    }
}

impl From<eyre::Report> for Error {
    fn from(e: eyre::Report) -> Self {
        Self::Internal { source: Some(e) }
    }
}

impl Error {
    pub fn internal(e: impl Into<eyre::Report>) -> Self {
        Self::Internal {
            source: Some(e.into()),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn backend(
        operation: &'static str,
        target: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Backend {
            operation,
            target: target.into(),
            message: message.into(),
        }
    }

    pub fn recovery(message: impl Into<String>) -> Self {
        Self::Recovery {
            message: message.into(),
        }
    }

    /// Network and persistence failures are worth another attempt; everything
    /// else is either the caller's fault or a deliberate short-circuit.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Backend { .. } | Self::Database { .. } | Self::Internal { .. } => true,

            Self::Validation { .. }
            | Self::QueueFull { .. }
            | Self::Migration { .. }
            | Self::Serialization { .. }
            | Self::CircuitOpen { .. }
            | Self::DeliveryExhausted { .. }
            | Self::Recovery { .. } => false,
        }
    }
}
