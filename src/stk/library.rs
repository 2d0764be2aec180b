//! Drive and volume state shared by the ACSLS engine and the tape server.
//!
//! A drive holds at most one volume and a volume sits in at most one drive;
//! `Drive::vol_id` and `Volume::mount` are always updated together.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info};

use super::catalog::{VolumeCatalog, VolumeRecord};
use super::constants::Status;
use super::tape::VirtualTape;
use super::tape_server::Reply;

pub type SharedLibrary = Arc<Mutex<Library>>;

/// Outbound line channel of a tape-server connection bound to a drive.
#[derive(Debug, Clone)]
pub struct DriveClient {
    pub id: u64,
    tx: UnboundedSender<Vec<u8>>,
}

impl DriveClient {
    pub fn new(id: u64, tx: UnboundedSender<Vec<u8>>) -> Self {
        Self { id, tx }
    }

    pub fn send(&self, reply: &Reply) {
        self.send_bytes(reply.to_line().into_bytes());
    }

    pub fn send_bytes(&self, bytes: Vec<u8>) {
        if self.tx.send(bytes).is_err() {
            debug!("Client {} has gone away", self.id);
        }
    }
}

/// A tape image loaded on a drive.
#[derive(Debug)]
pub struct MountedTape {
    pub drive_key: String,
    pub tape: VirtualTape,
}

#[derive(Debug)]
pub struct Volume {
    pub vsn: String,
    pub record: VolumeRecord,
    pub mount: Option<MountedTape>,
    /// Dropped from the catalog while mounted; removed on dismount.
    pub retired: bool,
}

impl Volume {
    pub fn drive_key(&self) -> Option<&str> {
        self.mount.as_ref().map(|m| m.drive_key.as_str())
    }
}

#[derive(Debug, Default)]
pub struct Drive {
    pub vol_id: Option<String>,
    pub client: Option<DriveClient>,
}

/// Result of a successful mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    pub vsn: String,
    pub drive_key: String,
    pub write_enabled: bool,
}

impl MountInfo {
    pub fn notification(&self) -> Reply {
        if self.write_enabled {
            Reply::MountedWriteEnabled {
                vsn: self.vsn.clone(),
                drive_key: self.drive_key.clone(),
            }
        } else {
            Reply::MountedReadOnly {
                vsn: self.vsn.clone(),
                drive_key: self.drive_key.clone(),
            }
        }
    }
}

/// Parse `M<lsm>P<panel>D<drive>` into its ordinals.
pub fn parse_drive_key(key: &str) -> Option<(u32, u32, u32)> {
    let rest = key.strip_prefix('M')?;
    let (lsm, rest) = rest.split_once('P')?;
    let (panel, drive) = rest.split_once('D')?;
    Some((lsm.parse().ok()?, panel.parse().ok()?, drive.parse().ok()?))
}

pub fn drive_key(lsm: u32, panel: u32, drive: u32) -> String {
    format!("M{}P{}D{}", lsm, panel, drive)
}

#[derive(Debug)]
pub struct Library {
    root: PathBuf,
    cells: u32,
    volumes: BTreeMap<String, Volume>,
    drives: BTreeMap<String, Drive>,
}

impl Library {
    pub fn new<P: Into<PathBuf>>(root: P, cells: u32) -> Self {
        Self {
            root: root.into(),
            cells,
            volumes: BTreeMap::new(),
            drives: BTreeMap::new(),
        }
    }

    pub fn into_shared(self) -> SharedLibrary {
        Arc::new(Mutex::new(self))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Merge a catalog into the live map. Mounted volumes keep their drive,
    /// handle and position; a mounted volume missing from the new catalog
    /// stays until it is dismounted.
    pub fn merge_catalog(&mut self, catalog: VolumeCatalog) {
        let mut added = 0;
        let mut updated = 0;
        let mut removed = 0;

        self.volumes.retain(|vsn, volume| {
            if catalog.contains_key(vsn) {
                return true;
            }
            if volume.mount.is_some() {
                volume.retired = true;
                return true;
            }
            removed += 1;
            false
        });

        for (vsn, record) in catalog {
            match self.volumes.get_mut(&vsn) {
                Some(volume) => {
                    volume.retired = false;
                    if volume.record != record {
                        volume.record = record;
                        updated += 1;
                    }
                }
                None => {
                    self.volumes.insert(
                        vsn.clone(),
                        Volume {
                            vsn,
                            record,
                            mount: None,
                            retired: false,
                        },
                    );
                    added += 1;
                }
            }
        }
        info!(
            "Catalog merged: {} added, {} updated, {} removed",
            added, updated, removed
        );
    }

    pub fn volume(&self, vsn: &str) -> Option<&Volume> {
        self.volumes.get(vsn)
    }

    pub fn volumes(&self) -> impl Iterator<Item = &Volume> {
        self.volumes.values()
    }

    pub fn drive(&self, key: &str) -> Option<&Drive> {
        self.drives.get(key)
    }

    /// VSN mounted on a drive.
    pub fn drive_volume(&self, key: &str) -> Option<&str> {
        self.drives.get(key).and_then(|d| d.vol_id.as_deref())
    }

    /// Cells not occupied by a cartridge; mounted cartridges leave their cell free.
    pub fn free_cells(&self) -> u32 {
        let in_cells = self.volumes.values().filter(|v| v.mount.is_none()).count() as u32;
        self.cells.saturating_sub(in_cells)
    }

    /// Mount `vsn` on the drive `key`. With `notify`, a client registered
    /// on the drive receives the unsolicited mount line.
    pub fn mount(&mut self, vsn: &str, key: &str, notify: bool) -> Result<MountInfo, Status> {
        let volume = self.volumes.get(vsn).ok_or(Status::VolumeNotInLibrary)?;
        if volume.drive_key() == Some(key) {
            return Err(Status::VolumeInDrive);
        }
        if self.drive_volume(key).is_some() {
            return Err(Status::DriveInUse);
        }
        if volume.mount.is_some() {
            return Err(Status::VolumeInUse);
        }

        let write_enabled = volume.record.write_enabled;
        let image = self.root.join(&volume.record.path);
        let tape = VirtualTape::open(&image, write_enabled).map_err(|e| {
            error!("Failed to open {} for {}: {}", image.display(), vsn, e);
            Status::LibraryFailure
        })?;

        if let Some(volume) = self.volumes.get_mut(vsn) {
            volume.mount = Some(MountedTape {
                drive_key: key.to_string(),
                tape,
            });
        }
        let drive = self.drives.entry(key.to_string()).or_default();
        drive.vol_id = Some(vsn.to_string());

        let info = MountInfo {
            vsn: vsn.to_string(),
            drive_key: key.to_string(),
            write_enabled,
        };
        info!(
            "Mounted {} on {} ({})",
            vsn,
            key,
            if write_enabled { "write-enabled" } else { "read-only" }
        );
        if notify {
            if let Some(client) = &drive.client {
                client.send(&info.notification());
            }
        }
        Ok(info)
    }

    /// Dismount the volume on drive `key`. `vsn` must match what is mounted
    /// unless `force` is set. Returns the VSN actually dismounted.
    pub fn dismount(&mut self, vsn: &str, key: &str, force: bool, notify: bool) -> Result<String, Status> {
        let mounted = self
            .drive_volume(key)
            .map(str::to_string)
            .ok_or(Status::DriveAvailable)?;
        if mounted != vsn && !force {
            return Err(Status::VolumeNotInDrive);
        }

        self.unload(key);
        info!("Dismounted {} from {}", mounted, key);
        if notify {
            if let Some(client) = self.drives.get(key).and_then(|d| d.client.as_ref()) {
                client.send(&Reply::DismountNotice {
                    vsn: mounted.clone(),
                    drive_key: key.to_string(),
                });
            }
        }
        Ok(mounted)
    }

    /// Clear both sides of a drive/volume cross reference, closing the image.
    fn unload(&mut self, key: &str) {
        if let Some(vsn) = self.drives.get_mut(key).and_then(|d| d.vol_id.take()) {
            let retired = match self.volumes.get_mut(&vsn) {
                Some(volume) => {
                    volume.mount = None;
                    volume.retired
                }
                None => false,
            };
            if retired {
                debug!("Removing retired volume {}", vsn);
                self.volumes.remove(&vsn);
            }
        }
    }

    /// Bind a tape-server client to a drive. Fails if another client holds it.
    pub fn register_client(&mut self, key: &str, client: DriveClient) -> bool {
        let drive = self.drives.entry(key.to_string()).or_default();
        match &drive.client {
            Some(existing) if existing.id != client.id => false,
            _ => {
                drive.client = Some(client);
                true
            }
        }
    }

    /// Drop a client's binding; its drive is unloaded as on a real disconnect.
    pub fn release_client(&mut self, key: &str, client_id: u64) {
        let owned = matches!(
            self.drives.get(key).and_then(|d| d.client.as_ref()),
            Some(c) if c.id == client_id
        );
        if !owned {
            return;
        }
        if let Some(vsn) = self.drive_volume(key).map(str::to_string) {
            self.unload(key);
            info!("Dismounted {} from {} on client disconnect", vsn, key);
        }
        if let Some(drive) = self.drives.get_mut(key) {
            drive.client = None;
        }
    }

    /// The mount information for whatever is loaded on a drive.
    pub fn mount_info(&self, key: &str) -> Option<MountInfo> {
        let vsn = self.drive_volume(key)?;
        let volume = self.volumes.get(vsn)?;
        Some(MountInfo {
            vsn: vsn.to_string(),
            drive_key: key.to_string(),
            write_enabled: volume.mount.as_ref()?.tape.is_writable(),
        })
    }

    /// The loaded tape of a drive, with its VSN.
    pub fn loaded_tape(&mut self, key: &str) -> Option<(&str, &mut VirtualTape)> {
        let vsn = self.drives.get(key)?.vol_id.as_deref()?;
        let volume = self.volumes.get_mut(vsn)?;
        let mount = volume.mount.as_mut()?;
        Some((volume.vsn.as_str(), &mut mount.tape))
    }
}
