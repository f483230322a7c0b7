use thiserror::Error;

/// Error taxonomy the controller and supervisor branch on.
///
/// Transient venue failures never escape the broker layer; everything that
/// reaches the controller is either recoverable in place (insufficient
/// balance, ledger write) or must travel up to the supervisor.
#[derive(Error, Debug)]
pub enum BotError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transient broker error: {0}")]
    TransientBroker(String),

    #[error("Broker rejected the request: {0}")]
    BrokerPermanent(String),

    #[error("Insufficient balance: required margin {required:.6}, available {available:.6}")]
    InsufficientBalance { required: f64, available: f64 },

    #[error("Venue state disagrees with controller state: {0}")]
    VenueDesync(String),

    #[error("Controller invariant violated: {0}")]
    LogicInvariant(String),

    #[error("Ledger write failed: {0}")]
    LedgerWrite(String),
}

impl BotError {
    /// Retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, BotError::TransientBroker(_))
    }

    /// The supervisor may restart the controller only for these, and only
    /// when the venue reports no position and no open reduce-only orders.
    pub fn is_restartable(&self) -> bool {
        matches!(
            self,
            BotError::BrokerPermanent(_) | BotError::LogicInvariant(_) | BotError::VenueDesync(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BotError>;
