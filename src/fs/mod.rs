//! Sandboxed filesystem surface: read/write/list/transfer, archives, and
//! remote fetch. Every user-supplied path funnels through the sandbox
//! before the filesystem is touched.

mod archive;
mod fetch;
mod handlers;
mod list;
mod transfer;
pub mod safepath;

pub use archive::{unzip_archive, zip_archive};
pub use fetch::fetch_remote_file;
pub use handlers::{read_file, write_file};
pub use list::list_dir;
pub use transfer::{download_file, upload_file};

use std::path::{Path, PathBuf};

use crate::http::ApiError;

use safepath::safe_path;

/// Sandbox a user path against the configured base; sandbox failures are
/// safe to expose verbatim.
pub(crate) fn sandboxed(base: &str, user: &str) -> Result<PathBuf, ApiError> {
    safe_path(Path::new(base), user).map_err(|err| ApiError::BadRequest(err.to_string()))
}
