use crate::application::repos::RepoError;

pub fn map_sqlx_error(err: sqlx::Error) -> RepoError {
    match err {
        sqlx::Error::RowNotFound => RepoError::NotFound,
        sqlx::Error::Database(db)
            if db.message().contains("duplicate key") || db.message().contains("violates") =>
        {
            RepoError::Integrity {
                message: db.message().to_string(),
            }
        }
        sqlx::Error::Database(db) if db.message().contains("invalid input syntax") => {
            RepoError::InvalidInput {
                message: db.message().to_string(),
            }
        }
        sqlx::Error::Database(db)
            if db
                .message()
                .contains("canceling statement due to user request") =>
        {
            RepoError::Timeout
        }
        sqlx::Error::PoolTimedOut => RepoError::Timeout,
        other => RepoError::from_persistence(other),
    }
}

pub(super) fn to_db_count(value: u32, field: &str) -> Result<i32, RepoError> {
    i32::try_from(value)
        .map_err(|_| RepoError::invalid_input(format!("{field} exceeds supported range")))
}

pub(super) fn from_db_count(value: i32, field: &str) -> Result<u32, RepoError> {
    u32::try_from(value).map_err(|_| RepoError::Integrity {
        message: format!("{field} is negative ({value})"),
    })
}
