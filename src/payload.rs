//! Archiving, chunking, and ConfigMap transport of the bootstrap payload.
//!
//! The Kubernetes API is the only file-transfer channel into an airgapped
//! cluster, and a single API object tops out around 1 MiB, so the seed-image
//! directory is archived, hashed, and sliced into chunk ConfigMaps the
//! injection pod mounts back into its working directory. The injector
//! executable travels the same way as one additional ConfigMap.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, ObjectMeta, PostParams};
use sha2::{Digest, Sha256};
use tokio::time::sleep;
use tracing::debug;

use crate::cluster::{ignore_not_found, Cluster, BINARY_CONFIGMAP, INJECTOR_BINARY_KEY, PAYLOAD_LABEL};
use crate::error::Result;

/// Default upper bound on a single chunk. Keeps the base64-encoded object
/// comfortably under etcd's ~1 MiB per-object ceiling.
pub const DEFAULT_CHUNK_SIZE: usize = 768 * 1024;

/// One size-bounded slice of the payload archive.
#[derive(Clone, Debug)]
pub struct PayloadChunk {
    /// Position of this chunk within the archive.
    pub index: usize,
    /// ConfigMap name and in-pod filename; sorts lexicographically by index.
    pub name: String,
    /// The raw bytes of this slice.
    pub data: Vec<u8>,
}

/// The full chunked payload plus the checksum of the pre-chunked archive.
#[derive(Clone, Debug)]
pub struct Payload {
    /// Chunks in index order.
    pub chunks: Vec<PayloadChunk>,
    /// Hex SHA-256 of the archive, handed to the injector so it can verify
    /// reassembly before serving anything.
    pub sha256sum: String,
}

impl Payload {
    /// Archives `dir` deterministically and chunks the result.
    pub fn from_directory(dir: &Path, chunk_size: usize) -> Result<Self> {
        Ok(Self::from_archive(archive_directory(dir)?, chunk_size))
    }

    /// Chunks an already-built archive.
    pub fn from_archive(archive: Vec<u8>, chunk_size: usize) -> Self {
        let sha256sum = hex::encode(Sha256::digest(&archive));
        Self {
            chunks: chunk_archive(&archive, chunk_size),
            sha256sum,
        }
    }

    /// The chunk ConfigMap names in mount order.
    pub fn chunk_names(&self) -> Vec<String> {
        self.chunks.iter().map(|chunk| chunk.name.clone()).collect()
    }
}

// Three digits of zero padding keep names in lexicographic mount order up to
// 999 chunks (roughly 768 MiB of archive at the default chunk size); a larger
// payload would need a wider pad.
fn chunk_name(index: usize) -> String {
    format!("zarf-payload-{:03}", index)
}

fn chunk_archive(archive: &[u8], chunk_size: usize) -> Vec<PayloadChunk> {
    archive
        .chunks(chunk_size)
        .enumerate()
        .map(|(index, data)| PayloadChunk {
            index,
            name: chunk_name(index),
            data: data.to_vec(),
        })
        .collect()
}

/// Builds a gzipped tar of every file under `dir` (paths relative to `dir`),
/// walking entries in sorted order and zeroing timestamps so the same input
/// always produces the same archive bytes.
pub fn archive_directory(dir: &Path) -> Result<Vec<u8>> {
    let mut files = Vec::new();
    collect_files(dir, dir, &mut files)?;
    files.sort();

    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for relative in &files {
        let data = std::fs::read(dir.join(relative))?;
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        builder.append_data(&mut header, relative, data.as_slice())?;
    }
    Ok(builder.into_inner()?.finish()?)
}

fn collect_files(root: &Path, dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(root, &path, files)?;
        } else {
            let relative = path
                .strip_prefix(root)
                .expect("walked path is always under the walk root");
            files.push(relative.to_path_buf());
        }
    }
    Ok(())
}

impl Cluster {
    /// Writes every payload chunk as a binary ConfigMap in the bootstrap
    /// namespace, pausing briefly between writes so the control plane is not
    /// overwhelmed. Returns the ConfigMap names in mount order. Any chunk left
    /// over from a previous attempt is replaced.
    pub async fn create_payload_config_maps(&self, payload: &Payload) -> Result<Vec<String>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client(), self.namespace());
        let total = payload.chunks.len();
        let mut names = Vec::with_capacity(total);
        for chunk in &payload.chunks {
            debug!(
                chunk = %chunk.name,
                "writing payload configmap {} of {}",
                chunk.index + 1,
                total
            );
            replace_config_map(&api, &chunk.name, &chunk.name, chunk.data.clone()).await?;
            names.push(chunk.name.clone());
            sleep(self.config().control_plane_pause).await;
        }
        Ok(names)
    }

    /// Writes the injector executable as a single binary ConfigMap, replacing
    /// any copy from a previous attempt.
    pub async fn create_injector_config_map(&self, binary_path: &Path) -> Result<()> {
        let data = tokio::fs::read(binary_path).await?;
        let api: Api<ConfigMap> = Api::namespaced(self.client(), self.namespace());
        replace_config_map(&api, BINARY_CONFIGMAP, INJECTOR_BINARY_KEY, data).await
    }
}

async fn replace_config_map(
    api: &Api<ConfigMap>,
    name: &str,
    key: &str,
    data: Vec<u8>,
) -> Result<()> {
    ignore_not_found(api.delete(name, &DeleteParams::default()).await)?;
    let config_map = ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            labels: Some(BTreeMap::from([(
                PAYLOAD_LABEL.0.to_owned(),
                PAYLOAD_LABEL.1.to_owned(),
            )])),
            ..Default::default()
        },
        binary_data: Some(BTreeMap::from([(key.to_owned(), ByteString(data))])),
        ..Default::default()
    };
    api.create(&PostParams::default(), &config_map).await?;
    Ok(())
}
