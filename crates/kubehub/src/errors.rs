//! Classify kube client failures into repository errors.

use carto_api::RepoError;
use kube::error::ErrorResponse;

/// Map an API failure onto the class the reconcilers react to.
pub fn repo_error(err: kube::Error) -> RepoError {
    match err {
        kube::Error::Api(ErrorResponse { code, message, reason, .. }) => {
            let msg = if message.is_empty() { reason } else { message };
            match code {
                404 => RepoError::NotFound(msg),
                401 | 403 => RepoError::Forbidden(msg),
                409 => RepoError::Conflict(msg),
                400 | 422 => RepoError::Invalid(msg),
                _ => RepoError::Internal(format!("{code}: {msg}")),
            }
        }
        other => RepoError::Internal(other.to_string()),
    }
}

/// `Ok(None)` for 404, the classified error otherwise.
pub fn absent_ok<T>(res: Result<T, kube::Error>) -> Result<Option<T>, RepoError> {
    match res {
        Ok(v) => Ok(Some(v)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(repo_error(e)),
    }
}
