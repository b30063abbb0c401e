//! Materializing prompt resources onto disk.
//!
//! Embedded resources carry their content inline (text or base64 blob)
//! and are written under the session's working directory before aider is
//! told about them. Linked resources are only resolved to a path.

use std::path::{Path, PathBuf};

use anyhow::Context;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::fs;
use url::Url;

use aider_acp_rpc::schema::EmbeddedResource;

/// A resource pulled out of prompt content, before materialization.
#[derive(Debug, Clone, PartialEq)]
pub enum PromptResource {
    Embedded(EmbeddedResource),
    Link { uri: String },
}

impl PromptResource {
    pub fn uri(&self) -> &str {
        match self {
            PromptResource::Embedded(resource) => resource.uri(),
            PromptResource::Link { uri } => uri,
        }
    }
}

/// Turn a resource URI into a filesystem path.
///
/// `file://` URIs are decoded; anything else is taken as a path and
/// resolved against the working directory when relative.
pub fn resolve_uri(uri: &str, working_dir: &Path) -> anyhow::Result<PathBuf> {
    if let Ok(url) = Url::parse(uri)
        && url.scheme() == "file"
    {
        return url
            .to_file_path()
            .map_err(|_| anyhow::anyhow!("invalid file URI: {uri}"));
    }

    let path = Path::new(uri);
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(working_dir.join(path))
    }
}

/// Write an embedded resource to disk (creating directories as needed) or
/// resolve a linked one. Returns the path to hand to aider.
pub async fn materialize(
    resource: &PromptResource,
    working_dir: &Path,
) -> anyhow::Result<PathBuf> {
    let path = resolve_uri(resource.uri(), working_dir)?;

    let PromptResource::Embedded(embedded) = resource else {
        return Ok(path);
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    match embedded {
        EmbeddedResource::Text(contents) => {
            fs::write(&path, &contents.text)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
        }
        EmbeddedResource::Blob(contents) => {
            let bytes = BASE64
                .decode(&contents.blob)
                .with_context(|| format!("decoding blob resource {}", contents.uri))?;
            fs::write(&path, bytes)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
        }
    }

    Ok(path)
}
