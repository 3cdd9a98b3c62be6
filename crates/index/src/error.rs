use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{store} unavailable: {message}")]
    Unavailable { store: &'static str, message: String },
    #[error("{store} request timed out")]
    Timeout { store: &'static str },
    #[error("{store} rejected the request: {message}")]
    Rejected { store: &'static str, message: String },
    #[error("relational store error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt row in {table}: {message}")]
    Corrupt { table: &'static str, message: String },
    #[error("document {0} already exists")]
    Duplicate(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Unavailable { .. } | StoreError::Timeout { .. } => true,
            StoreError::Rejected { .. } | StoreError::Corrupt { .. } | StoreError::Duplicate(_) => {
                false
            }
            StoreError::Database(e) => match e {
                sqlx::Error::Io(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed => true,
                sqlx::Error::Database(db) => {
                    let message = db.message();
                    message.contains("locked") || message.contains("busy")
                }
                _ => false,
            },
        }
    }

    pub(crate) fn from_http(store: &'static str, e: reqwest::Error) -> Self {
        if e.is_timeout() {
            StoreError::Timeout { store }
        } else {
            StoreError::Unavailable {
                store,
                message: e.to_string(),
            }
        }
    }

    pub(crate) fn from_status(store: &'static str, status: u16, body: String) -> Self {
        if status == 429 || status >= 500 {
            StoreError::Unavailable {
                store,
                message: format!("status {status}: {body}"),
            }
        } else {
            StoreError::Rejected {
                store,
                message: format!("status {status}: {body}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_classification() {
        assert!(StoreError::from_status("qdrant", 503, String::new()).is_transient());
        assert!(StoreError::from_status("qdrant", 429, String::new()).is_transient());
        assert!(!StoreError::from_status("qdrant", 400, "bad vector".into()).is_transient());
    }

    #[test]
    fn pool_exhaustion_is_transient() {
        assert!(StoreError::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!StoreError::Database(sqlx::Error::RowNotFound).is_transient());
        assert!(!StoreError::Duplicate("doc-1".into()).is_transient());
    }
}
