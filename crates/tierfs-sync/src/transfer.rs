//! Object-transfer helpers: bounded retries with re-authentication on a
//! 401, and the tolerance rules for each verb (a delete of an absent
//! object succeeds; a get of one is NotFound).

use tierfs_backend::{is_success, ObjectBackend, STATUS_NOT_FOUND, STATUS_UNAUTHORIZED};
use tierfs_error::{Result, TierError};

/// Runs one object request until it lands in the success band or the
/// retry budget is spent. A 401 re-authenticates before the retry; any
/// other non-2xx status just retries (the store may be transiently
/// unhappy).
fn with_retries<T>(
    backend: &dyn ObjectBackend,
    max_retries: u32,
    what: &str,
    mut op: impl FnMut() -> Result<(u16, T)>,
) -> Result<T> {
    let mut attempt = 0_u32;
    loop {
        let (status, value) = op()?;
        if is_success(status) {
            return Ok(value);
        }
        if status == STATUS_NOT_FOUND {
            return Err(TierError::NotFound(what.to_owned()));
        }
        attempt += 1;
        if attempt > max_retries {
            return Err(TierError::Backend {
                status,
                detail: what.to_owned(),
            });
        }
        tracing::warn!(status, what, attempt, "object request failed, retrying");
        if status == STATUS_UNAUTHORIZED {
            let auth_status = backend.authenticate()?;
            if !is_success(auth_status) {
                return Err(TierError::Backend {
                    status: auth_status,
                    detail: format!("re-authentication for {what}"),
                });
            }
        }
    }
}

pub fn put_object(
    backend: &dyn ObjectBackend,
    max_retries: u32,
    name: &str,
    data: &[u8],
) -> Result<()> {
    with_retries(backend, max_retries, name, || {
        backend.put(name, data).map(|status| (status, ()))
    })
}

pub fn get_object(backend: &dyn ObjectBackend, max_retries: u32, name: &str) -> Result<Vec<u8>> {
    with_retries(backend, max_retries, name, || backend.get(name))
}

/// Absent objects count as deleted.
pub fn delete_object(backend: &dyn ObjectBackend, max_retries: u32, name: &str) -> Result<()> {
    with_retries(backend, max_retries, name, || {
        backend.delete(name).map(|status| {
            let status = if status == STATUS_NOT_FOUND { 200 } else { status };
            (status, ())
        })
    })
}
