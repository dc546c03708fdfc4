use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Invalid configuration: {message}"))]
    Config { message: String },

    #[snafu(display("Error returned from database"))]
    Persist {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Error running migrations"))]
    Migration {
        #[snafu(source)]
        source: sqlx::migrate::MigrateError,
    },

    #[snafu(display("Frame too short: {have} bytes"))]
    DecodeShort { have: usize },

    #[snafu(display(
        "Malformed frame: header declares {declared} payload bytes, frame carries {actual}"
    ))]
    DecodeMalformed { declared: usize, actual: usize },

    #[snafu(display("Upstream session failed: {message}"))]
    SessionFatal { message: String },

    #[snafu(display("Delivery to {target} failed: {message}"))]
    DeliverTransient { target: String, message: String },

    #[snafu(display("Shutting down"))]
    Canceled,
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        Self::Persist { source }
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(source: sqlx::migrate::MigrateError) -> Self {
        Self::Migration { source }
    }
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn session(message: impl Into<String>) -> Self {
        Self::SessionFatal {
            message: message.into(),
        }
    }

    pub fn deliver(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DeliverTransient {
            target: target.into(),
            message: message.into(),
        }
    }
}
