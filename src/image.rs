use sha::sha256::Sha256;
use sha::utils::{Digest, DigestExt};
use std::collections::HashMap;

/// The identity block of a VM image: who owns the program and where its
/// source lives. Parsed from the image's manifest by the loader (an
/// external collaborator); carried here read-only.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct VmManifest {
    pub name: String,
    pub owner: String,
    #[serde(rename = "repoURL")]
    pub repo_url: String,
}

/// A loaded, self-contained program: manifest, the main script that runs
/// once to register shared functions, and any bundled assets. Read-only
/// after construction and shareable across the VM's whole lifetime.
#[derive(Debug, Clone)]
pub struct VmImage {
    manifest: VmManifest,
    main_script: String,
    assets: HashMap<String, Vec<u8>>,
}

impl VmImage {
    pub fn new(manifest: VmManifest, main_script: impl Into<String>) -> Self {
        VmImage {
            manifest,
            main_script: main_script.into(),
            assets: HashMap::new(),
        }
    }

    pub fn with_assets(mut self, assets: HashMap<String, Vec<u8>>) -> Self {
        self.assets = assets;
        self
    }

    pub fn manifest(&self) -> &VmManifest {
        &self.manifest
    }

    pub fn main_script(&self) -> &str {
        &self.main_script
    }

    pub fn asset(&self, name: &str) -> Option<&[u8]> {
        self.assets.get(name).map(|bytes| bytes.as_slice())
    }

    /// The image's identity for `ResolveVM` and log lines: the hex SHA-256
    /// of the main script. Two VMs running the same script share a
    /// fingerprint, which is intended — the fingerprint names the program,
    /// not the instance.
    pub fn fingerprint(&self) -> String {
        fingerprint_of(&self.main_script)
    }
}

pub fn fingerprint_of(main_script: &str) -> String {
    Sha256::default().digest(main_script.as_bytes()).to_hex()
}
