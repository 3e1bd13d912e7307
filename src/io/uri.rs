//! URI parsing for the storage backends
//!
//! Recognized schemes: `file://` (and bare paths), `az://<container>@
//! <account>.blob.core.windows.net/<path>`, `gs://<bucket>/<path>`, and
//! `hdfs://<authority>/<path>`.

use crate::error::{Result, StorageError};

/// A storage URI broken into backend, authority and in-backend path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedUri {
    File {
        path: String,
    },
    Azure {
        account: String,
        container: String,
        path: String,
    },
    Gcs {
        bucket: String,
        path: String,
    },
    Hdfs {
        authority: String,
        path: String,
    },
}

impl ParsedUri {
    /// Registry key shared by all paths on the same backend instance.
    pub fn authority_key(&self) -> String {
        match self {
            ParsedUri::File { .. } => "file://".to_string(),
            ParsedUri::Azure {
                account, container, ..
            } => format!("az://{container}@{account}"),
            ParsedUri::Gcs { bucket, .. } => format!("gs://{bucket}"),
            ParsedUri::Hdfs { authority, .. } => format!("hdfs://{authority}"),
        }
    }

    /// The path handed to the backend.
    pub fn path(&self) -> &str {
        match self {
            ParsedUri::File { path } => path,
            ParsedUri::Azure { path, .. } => path,
            ParsedUri::Gcs { path, .. } => path,
            ParsedUri::Hdfs { path, .. } => path,
        }
    }
}

/// Parse a storage URI; bare paths are local filesystem paths.
pub fn parse_uri(uri: &str) -> Result<ParsedUri> {
    let Some((scheme, rest)) = uri.split_once("://") else {
        return Ok(ParsedUri::File {
            path: uri.to_string(),
        });
    };

    match scheme {
        "file" => Ok(ParsedUri::File {
            path: rest.to_string(),
        }),
        "az" => {
            // az://<container>@<account>.blob.core.windows.net/<path>
            let (container, after) = rest.split_once('@').ok_or_else(|| {
                StorageError::InvalidArgument(format!(
                    "azure uri {uri} is missing the <container>@<account> authority"
                ))
            })?;
            let (host, path) = match after.split_once('/') {
                Some((h, p)) => (h, p),
                None => (after, ""),
            };
            let account = host.split('.').next().unwrap_or_default();
            if container.is_empty() || account.is_empty() {
                return Err(StorageError::InvalidArgument(format!(
                    "azure uri {uri} does not name an account and a container"
                )));
            }
            Ok(ParsedUri::Azure {
                account: account.to_string(),
                container: container.to_string(),
                path: path.trim_matches('/').to_string(),
            })
        }
        "gs" => {
            let (bucket, path) = match rest.split_once('/') {
                Some((b, p)) => (b, p),
                None => (rest, ""),
            };
            if bucket.is_empty() {
                return Err(StorageError::InvalidArgument(format!(
                    "gcs uri {uri} does not name a bucket"
                )));
            }
            Ok(ParsedUri::Gcs {
                bucket: bucket.to_string(),
                path: path.trim_matches('/').to_string(),
            })
        }
        "hdfs" => {
            let (authority, path) = match rest.split_once('/') {
                Some((a, p)) => (a, p),
                None => (rest, ""),
            };
            Ok(ParsedUri::Hdfs {
                authority: authority.to_string(),
                path: format!("/{}", path.trim_matches('/')),
            })
        }
        other => Err(StorageError::Unsupported(format!(
            "unknown uri scheme {other}://"
        ))),
    }
}

/// Append a child segment to a URI.
pub fn join(uri: &str, child: &str) -> String {
    format!("{}/{}", uri.trim_end_matches('/'), child.trim_matches('/'))
}

/// Last path segment of a URI.
pub fn file_name(uri: &str) -> &str {
    uri.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
}
