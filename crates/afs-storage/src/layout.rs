//! Storage layout manager
//!
//! Maps logical objects to physical paths:
//! ```text
//! root/
//! +-- .afs-instance                 instance marker (UUID, format version)
//! +-- <share>/                      e.g. "1", "2", ...
//!     +-- <shard>/<shard>/<shard>/  fixed-width hash segments of the owner id
//!         +-- <owner>/
//!             +-- <relative path>
//! ```
//!
//! New owners are placed in the configured incoming share; an owner already
//! materialized in some share stays there. `apply` is the only mutator of
//! on-disk state and converges to the same result when repeated.

use afs_common::config::StorageConfig;
use afs_common::types::RESERVED_PREFIX;
use afs_common::{Error, ObjectInfo, ObjectPath, ObjectRef, Operation, OwnerId, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;
use xxhash_rust::xxh64::xxh64;

/// Name of the instance marker file in the storage root
pub const INSTANCE_MARKER: &str = ".afs-instance";

/// Current on-disk layout version
pub const LAYOUT_VERSION: u32 = 1;

/// Seed for the default shard hash
const SHARD_SEED: u64 = 0x4146_535f_5348_4152; // "AFS_SHAR"

/// Deterministic owner to shard-path function
///
/// Implementations must always return the same segments for the same owner.
pub trait ShardFunction: Send + Sync {
    /// Name used in logs and the instance marker
    fn name(&self) -> &str;

    /// Directory segments between the share and the owner directory
    fn segments(&self, owner: &OwnerId) -> Vec<String>;
}

/// Default shard function: fixed-width hex pairs of an xxh64 hash
#[derive(Clone, Debug)]
pub struct HashShard {
    depth: usize,
    name: String,
}

impl HashShard {
    /// Create a shard function producing `depth` segments (1..=8)
    #[must_use]
    pub fn new(depth: usize) -> Self {
        let depth = depth.clamp(1, 8);
        Self {
            depth,
            name: format!("xxh64-hex/{depth}"),
        }
    }
}

impl ShardFunction for HashShard {
    fn name(&self) -> &str {
        &self.name
    }

    fn segments(&self, owner: &OwnerId) -> Vec<String> {
        let hash = xxh64(owner.as_str().as_bytes(), SHARD_SEED).to_be_bytes();
        hash.iter()
            .take(self.depth)
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

/// Contents of the instance marker file
#[derive(Clone, Debug, Serialize, Deserialize)]
struct InstanceMarker {
    instance_uuid: Uuid,
    version: u32,
    shard_function: String,
    created_at: u64,
}

/// Storage layout manager
pub struct StorageLayout {
    root: PathBuf,
    instance_uuid: Uuid,
    incoming_share: String,
    shard: Box<dyn ShardFunction>,
    /// Owner -> share cache; verified on use
    placements: RwLock<HashMap<OwnerId, String>>,
}

impl StorageLayout {
    /// Open the storage root with the default shard function
    pub fn open(config: &StorageConfig) -> Result<Self> {
        Self::with_shard_function(config, Box::new(HashShard::new(config.shard_depth)))
    }

    /// Open the storage root with a custom shard function
    pub fn with_shard_function(
        config: &StorageConfig,
        shard: Box<dyn ShardFunction>,
    ) -> Result<Self> {
        let root = config.root.clone();
        fs::create_dir_all(&root).map_err(|e| {
            Error::storage(format!("failed to create storage root {}: {e}", root.display()))
        })?;

        let instance_uuid = Self::check_instance(&root, config.instance_uuid, shard.name())?;

        fs::create_dir_all(root.join(&config.incoming_share))?;

        info!(
            "Opened storage at {}: instance={}, incoming share={}, shard={}",
            root.display(),
            instance_uuid,
            config.incoming_share,
            shard.name()
        );

        Ok(Self {
            root,
            instance_uuid,
            incoming_share: config.incoming_share.clone(),
            shard,
            placements: RwLock::new(HashMap::new()),
        })
    }

    /// Read or create the instance marker, enforcing the configured UUID
    fn check_instance(root: &Path, configured: Uuid, shard_name: &str) -> Result<Uuid> {
        let marker_path = root.join(INSTANCE_MARKER);
        match fs::read(&marker_path) {
            Ok(data) => {
                let marker: InstanceMarker = serde_json::from_slice(&data).map_err(|e| {
                    Error::storage(format!("corrupt instance marker {}: {e}", marker_path.display()))
                })?;
                if !configured.is_nil() && marker.instance_uuid != configured {
                    return Err(Error::Configuration(format!(
                        "storage root {} belongs to instance {}, configured {}",
                        root.display(),
                        marker.instance_uuid,
                        configured
                    )));
                }
                if marker.shard_function != shard_name {
                    return Err(Error::Configuration(format!(
                        "storage root {} was laid out with shard function {}, not {}",
                        root.display(),
                        marker.shard_function,
                        shard_name
                    )));
                }
                Ok(marker.instance_uuid)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let instance_uuid = if configured.is_nil() {
                    Uuid::new_v4()
                } else {
                    configured
                };
                let marker = InstanceMarker {
                    instance_uuid,
                    version: LAYOUT_VERSION,
                    shard_function: shard_name.to_string(),
                    created_at: std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_secs(),
                };
                let data = serde_json::to_vec_pretty(&marker)
                    .map_err(|e| Error::Serialization(e.to_string()))?;
                write_atomic(&marker_path, &data)?;
                info!("Initialized storage instance {instance_uuid}");
                Ok(instance_uuid)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Storage root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Globally unique storage instance identifier
    pub const fn instance_uuid(&self) -> Uuid {
        self.instance_uuid
    }

    /// Share receiving new owners
    pub fn incoming_share(&self) -> &str {
        &self.incoming_share
    }

    /// Shard segments for an owner
    pub fn shard_segments(&self, owner: &OwnerId) -> Vec<String> {
        self.shard.segments(owner)
    }

    /// List the shares present under the root
    pub fn shares(&self) -> Result<Vec<String>> {
        let mut shares = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with('.') {
                shares.push(name);
            }
        }
        shares.sort();
        Ok(shares)
    }

    fn owner_dir_in(&self, share: &str, owner: &OwnerId) -> PathBuf {
        let mut path = self.root.join(share);
        for segment in self.shard.segments(owner) {
            path.push(segment);
        }
        path.push(owner.as_str());
        path
    }

    /// Share currently hosting `owner`, if it is materialized
    pub fn share_of(&self, owner: &OwnerId) -> Result<Option<String>> {
        if let Some(share) = self.placements.read().get(owner).cloned() {
            if self.owner_dir_in(&share, owner).is_dir() {
                return Ok(Some(share));
            }
            self.placements.write().remove(owner);
        }

        for share in self.shares()? {
            if self.owner_dir_in(&share, owner).is_dir() {
                self.placements.write().insert(owner.clone(), share.clone());
                return Ok(Some(share));
            }
        }
        Ok(None)
    }

    /// Physical directory of `owner`: its existing share, or the incoming one
    pub fn owner_dir(&self, owner: &OwnerId) -> Result<PathBuf> {
        let share = self
            .share_of(owner)?
            .unwrap_or_else(|| self.incoming_share.clone());
        Ok(self.owner_dir_in(&share, owner))
    }

    /// Physical path of an object
    pub fn resolve(&self, object: &ObjectRef) -> Result<PathBuf> {
        let mut path = self.owner_dir(&object.owner)?;
        for segment in object.path.segments() {
            path.push(segment);
        }
        Ok(path)
    }

    /// Size of a committed object, `None` if it does not exist
    ///
    /// A directory at the path is not an object. A file where one of the
    /// parent directories should be is reported as a path conflict.
    pub fn size_of(&self, object: &ObjectRef) -> Result<Option<u64>> {
        let path = self.resolve(object)?;
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotADirectory => Err(Error::PathConflict {
                object: object.clone(),
                reason: "a parent directory is a file",
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Committed objects stored below `object`'s path, when it is a directory
    pub fn descendants(&self, object: &ObjectRef) -> Result<Vec<ObjectRef>> {
        let dir = self.resolve(object)?;
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut found = Vec::new();
        walk(&dir, object.path.as_str(), &mut found)?;
        Ok(found
            .into_iter()
            .map(|info| ObjectRef::new(object.owner.clone(), info.path))
            .collect())
    }

    /// Check whether a committed object exists
    pub fn exists(&self, object: &ObjectRef) -> Result<bool> {
        Ok(self.size_of(object)?.is_some())
    }

    /// Read up to `len` bytes at `offset` from a committed object
    pub fn read(&self, object: &ObjectRef, offset: u64, len: u64) -> Result<Vec<u8>> {
        let path = self.resolve(object)?;
        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if is_absent(&e) => return Err(Error::ObjectNotFound(object.clone())),
            Err(e) => return Err(e.into()),
        };
        if !file.metadata()?.is_file() {
            return Err(Error::ObjectNotFound(object.clone()));
        }
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::new();
        file.take(len).read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Read a whole committed object, `None` if it does not exist
    pub fn read_all(&self, object: &ObjectRef) -> Result<Option<Vec<u8>>> {
        let path = self.resolve(object)?;
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if is_absent(&e) || e.kind() == ErrorKind::IsADirectory => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// List the committed objects of an owner, sorted by path
    pub fn list(&self, owner: &OwnerId) -> Result<Vec<ObjectInfo>> {
        let Some(share) = self.share_of(owner)? else {
            return Ok(Vec::new());
        };
        let dir = self.owner_dir_in(&share, owner);
        let mut objects = Vec::new();
        walk(&dir, "", &mut objects)?;
        objects.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(objects)
    }

    /// Apply one operation to storage
    ///
    /// Every branch tolerates finding its effect already present, so WAL
    /// replay may re-run operations that were partially or fully applied.
    pub fn apply(&self, op: &Operation) -> Result<()> {
        debug!("Applying {} {:?}", op.kind(), op.objects());
        match op {
            Operation::Create { object } => {
                let path = self.resolve(object)?;
                ensure_parent(&path)?;
                // Never truncate: a replayed create must not wipe later writes.
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)?
                    .sync_all()?;
                sync_parent(&path);
            }
            Operation::Write {
                object,
                offset,
                data,
            } => {
                let path = self.resolve(object)?;
                ensure_parent(&path)?;
                let file = OpenOptions::new()
                    .create(true)
                    .truncate(false)
                    .write(true)
                    .open(&path)?;
                file.write_all_at(data, *offset)?;
                file.sync_data()?;
                sync_parent(&path);
            }
            Operation::Copy { source, target } => {
                let src = self.resolve(source)?;
                let dst = self.resolve(target)?;
                match fs::read(&src) {
                    Ok(data) => {
                        ensure_parent(&dst)?;
                        write_atomic(&dst, &data)?;
                    }
                    Err(e) if e.kind() == ErrorKind::NotFound => {
                        // Source removed by a later operation of a replayed history.
                        warn!("Copy source {} missing, skipping", source);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Operation::Move { source, target } => {
                let src = self.resolve(source)?;
                let dst = self.resolve(target)?;
                if !src.exists() {
                    if !dst.exists() {
                        warn!("Move {} -> {}: neither side present, skipping", source, target);
                    }
                    return Ok(());
                }
                ensure_parent(&dst)?;
                match fs::rename(&src, &dst) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::CrossesDevices => {
                        let data = fs::read(&src)?;
                        write_atomic(&dst, &data)?;
                        fs::remove_file(&src)?;
                    }
                    Err(e) => return Err(e.into()),
                }
                sync_parent(&dst);
                self.prune(&source.owner, &src)?;
            }
            Operation::Delete { object } => {
                let path = self.resolve(object)?;
                match fs::remove_file(&path) {
                    Ok(()) => sync_parent(&path),
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                self.prune(&object.owner, &path)?;
            }
        }
        Ok(())
    }

    /// Remove empty directories from `removed`'s parent up to the owner dir
    fn prune(&self, owner: &OwnerId, removed: &Path) -> Result<()> {
        let Some(share) = self.share_of(owner)? else {
            return Ok(());
        };
        let owner_dir = self.owner_dir_in(&share, owner);
        let mut dir = removed.parent();
        while let Some(current) = dir {
            if !current.starts_with(&owner_dir) {
                break;
            }
            match fs::remove_dir(current) {
                Ok(()) => {}
                // Not empty (or already gone): nothing more to prune.
                Err(_) => break,
            }
            if current == owner_dir {
                self.placements.write().remove(owner);
                sync_parent(current);
                break;
            }
            dir = current.parent();
        }
        Ok(())
    }
}

/// Collect regular files below `dir`, skipping engine-reserved names
fn walk(dir: &Path, prefix: &str, out: &mut Vec<ObjectInfo>) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(RESERVED_PREFIX) {
            continue;
        }
        let rel = if prefix.is_empty() {
            name
        } else {
            format!("{prefix}/{name}")
        };
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk(&entry.path(), &rel, out)?;
        } else if file_type.is_file() {
            out.push(ObjectInfo {
                path: ObjectPath::new_unchecked(rel),
                size: entry.metadata()?.len(),
            });
        }
    }
    Ok(())
}

/// No object can live at a path that is missing or runs through a file
fn is_absent(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory)
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Best-effort directory fsync so renames and creates survive a crash
fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent()
        && let Ok(dir) = File::open(parent)
        && let Err(e) = dir.sync_all()
    {
        debug!("Directory sync of {} failed: {e}", parent.display());
    }
}

/// Write `data` to a reserved temporary next to `path` and rename it in
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::storage(format!("{} has no parent", path.display())))?;
    let tmp = parent.join(format!("{RESERVED_PREFIX}-tmp-{}", Uuid::new_v4().simple()));
    let result = (|| -> Result<()> {
        let file = File::create(&tmp)?;
        file.write_all_at(data, 0)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result?;
    sync_parent(path);
    Ok(())
}
