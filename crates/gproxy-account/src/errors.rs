use thiserror::Error;

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("account {0} is unknown")]
    Unknown(crate::AccountId),
    #[error("account {0} is not schedulable")]
    NotSchedulable(crate::AccountId),
}
