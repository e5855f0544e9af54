//! SQLite-backed director state.
//!
//! Holds instance, VM, persistent-disk and snapshot records plus the orphan
//! tables disks move to when they are superseded. Multi-record transitions
//! (the active-disk swap, orphaning, unorphaning) each run in a single
//! transaction, so a concurrent reader sees either the state before or the
//! state after, never a mix.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use rollout_id::{
    AgentId, DiskCid, DiskId, InstanceId, OrphanDiskId, SnapshotCid, SnapshotId, VmCid,
};
use rollout_reconcile::SpecHash;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;
use tracing::{debug, info};

use crate::plan::TargetState;

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    Invalid(String),

    #[error("store lock poisoned")]
    Poisoned,
}

// =============================================================================
// Records
// =============================================================================

/// A logical instance of an instance group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub deployment: String,
    pub group: String,
    pub index: u32,
    pub availability_zone: Option<String>,
    /// Lifecycle state the instance was last converged to.
    pub state: TargetState,
}

impl InstanceRecord {
    /// `group/uuid`, the name kept on orphaned disks.
    pub fn name(&self) -> String {
        format!("{}/{}", self.group, self.id.label())
    }
}

/// The VM currently backing an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmRecord {
    pub cid: VmCid,
    pub agent_id: AgentId,
    /// Fingerprint of the last spec applied to the agent.
    pub applied_spec: Option<SpecHash>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiskRecord {
    pub id: DiskId,
    pub instance: InstanceId,
    pub cid: DiskCid,
    pub size_mb: u64,
    pub cloud_properties: serde_json::Value,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub id: SnapshotId,
    pub disk: DiskId,
    pub cid: SnapshotCid,
    pub clean: bool,
    /// Unix seconds.
    pub created_at: i64,
}

/// A disk no longer owned by any instance, kept for deferred deletion.
#[derive(Debug, Clone, PartialEq)]
pub struct OrphanDiskRecord {
    pub id: OrphanDiskId,
    pub cid: DiskCid,
    pub size_mb: u64,
    pub cloud_properties: serde_json::Value,
    pub availability_zone: Option<String>,
    pub deployment: String,
    /// `group/uuid` of the former owner.
    pub instance_name: String,
    /// Unix seconds.
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanSnapshotRecord {
    pub id: SnapshotId,
    pub orphan_disk: OrphanDiskId,
    pub cid: SnapshotCid,
    pub clean: bool,
    pub snapshot_created_at: i64,
    pub created_at: i64,
}

/// An active-disk swap that has been prepared but not committed.
///
/// Until [`Store::commit_activation`] runs, `old` stays the active disk and
/// `new` is an inactive record. Committing flips both flags in one
/// transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingActivation {
    instance: InstanceId,
    old: Option<DiskId>,
    new: Option<DiskId>,
}

impl PendingActivation {
    pub fn new(instance: InstanceId, old: Option<DiskId>, new: Option<DiskId>) -> Self {
        Self { instance, old, new }
    }

    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }

    pub fn old(&self) -> Option<&DiskId> {
        self.old.as_ref()
    }

    pub fn new_disk(&self) -> Option<&DiskId> {
        self.new.as_ref()
    }
}

// =============================================================================
// Store
// =============================================================================

/// SQLite state store.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        Ok(store)
    }

    /// Open an in-memory store.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                id TEXT PRIMARY KEY,
                deployment TEXT NOT NULL,
                group_name TEXT NOT NULL,
                idx INTEGER NOT NULL,
                availability_zone TEXT,
                state TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS vms (
                instance_id TEXT PRIMARY KEY,
                cid TEXT NOT NULL UNIQUE,
                agent_id TEXT NOT NULL,
                applied_spec TEXT
            );

            CREATE TABLE IF NOT EXISTS persistent_disks (
                id TEXT PRIMARY KEY,
                instance_id TEXT NOT NULL,
                cid TEXT NOT NULL UNIQUE,
                size_mb INTEGER NOT NULL,
                cloud_properties TEXT NOT NULL,
                active INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_persistent_disks_instance
                ON persistent_disks(instance_id);

            CREATE TABLE IF NOT EXISTS snapshots (
                id TEXT PRIMARY KEY,
                disk_id TEXT NOT NULL,
                cid TEXT NOT NULL,
                clean INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS orphan_disks (
                id TEXT PRIMARY KEY,
                cid TEXT NOT NULL UNIQUE,
                size_mb INTEGER NOT NULL,
                cloud_properties TEXT NOT NULL,
                availability_zone TEXT,
                deployment TEXT NOT NULL,
                instance_name TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS orphan_snapshots (
                id TEXT PRIMARY KEY,
                orphan_disk_id TEXT NOT NULL,
                cid TEXT NOT NULL UNIQUE,
                clean INTEGER NOT NULL,
                snapshot_created_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );
            "#,
        )?;

        debug!("Director store schema initialized");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Instances
    // -------------------------------------------------------------------------

    /// Insert or update an instance record.
    pub fn upsert_instance(&self, record: &InstanceRecord) -> Result<(), StoreError> {
        self.conn()?.execute(
            r#"
            INSERT INTO instances (id, deployment, group_name, idx, availability_zone, state)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(id) DO UPDATE SET
                deployment = excluded.deployment,
                group_name = excluded.group_name,
                idx = excluded.idx,
                availability_zone = excluded.availability_zone,
                state = excluded.state
            "#,
            params![
                record.id.to_string(),
                record.deployment,
                record.group,
                record.index,
                record.availability_zone,
                record.state.as_str(),
            ],
        )?;
        Ok(())
    }

    pub fn instance(&self, id: &InstanceId) -> Result<Option<InstanceRecord>, StoreError> {
        let conn = self.conn()?;
        instance_in(&conn, id)
    }

    pub fn set_instance_state(
        &self,
        id: &InstanceId,
        state: TargetState,
    ) -> Result<(), StoreError> {
        let updated = self.conn()?.execute(
            "UPDATE instances SET state = ?1 WHERE id = ?2",
            params![state.as_str(), id.to_string()],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Delete an instance record and its VM record.
    pub fn delete_instance(&self, id: &InstanceId) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM vms WHERE instance_id = ?1",
            params![id.to_string()],
        )?;
        tx.execute("DELETE FROM instances WHERE id = ?1", params![id.to_string()])?;
        tx.commit()?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // VMs
    // -------------------------------------------------------------------------

    pub fn set_vm(&self, instance: &InstanceId, vm: &VmRecord) -> Result<(), StoreError> {
        self.conn()?.execute(
            r#"
            INSERT INTO vms (instance_id, cid, agent_id, applied_spec)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(instance_id) DO UPDATE SET
                cid = excluded.cid,
                agent_id = excluded.agent_id,
                applied_spec = excluded.applied_spec
            "#,
            params![
                instance.to_string(),
                vm.cid.as_str(),
                vm.agent_id.as_str(),
                vm.applied_spec.as_ref().map(SpecHash::as_str),
            ],
        )?;
        Ok(())
    }

    pub fn vm(&self, instance: &InstanceId) -> Result<Option<VmRecord>, StoreError> {
        self.conn()?
            .query_row(
                "SELECT cid, agent_id, applied_spec FROM vms WHERE instance_id = ?1",
                params![instance.to_string()],
                |row| {
                    let applied: Option<String> = row.get(2)?;
                    Ok(VmRecord {
                        cid: parsed(row, 0)?,
                        agent_id: parsed(row, 1)?,
                        applied_spec: applied.map(SpecHash::from_recorded),
                    })
                },
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn clear_vm(&self, instance: &InstanceId) -> Result<(), StoreError> {
        self.conn()?.execute(
            "DELETE FROM vms WHERE instance_id = ?1",
            params![instance.to_string()],
        )?;
        Ok(())
    }

    /// Records which spec the instance's VM last received.
    pub fn record_applied_spec(
        &self,
        instance: &InstanceId,
        spec: &SpecHash,
    ) -> Result<(), StoreError> {
        let updated = self.conn()?.execute(
            "UPDATE vms SET applied_spec = ?1 WHERE instance_id = ?2",
            params![spec.as_str(), instance.to_string()],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("vm of {instance}")));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Persistent disks
    // -------------------------------------------------------------------------

    pub fn insert_disk(&self, disk: &DiskRecord) -> Result<(), StoreError> {
        self.conn()?.execute(
            r#"
            INSERT INTO persistent_disks (id, instance_id, cid, size_mb, cloud_properties, active)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                disk.id.to_string(),
                disk.instance.to_string(),
                disk.cid.as_str(),
                disk.size_mb as i64,
                disk.cloud_properties.to_string(),
                disk.active,
            ],
        )?;
        Ok(())
    }

    pub fn disk(&self, id: &DiskId) -> Result<Option<DiskRecord>, StoreError> {
        let conn = self.conn()?;
        disk_in(&conn, id)
    }

    /// All disk records of an instance, active first.
    pub fn disks(&self, instance: &InstanceId) -> Result<Vec<DiskRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, instance_id, cid, size_mb, cloud_properties, active
             FROM persistent_disks WHERE instance_id = ?1 ORDER BY active DESC, id",
        )?;
        let disks = stmt
            .query_map(params![instance.to_string()], disk_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(disks)
    }

    /// The active disk of an instance.
    pub fn active_disk(&self, instance: &InstanceId) -> Result<Option<DiskRecord>, StoreError> {
        let mut active: Vec<DiskRecord> = self
            .disks(instance)?
            .into_iter()
            .filter(|d| d.active)
            .collect();
        if active.len() > 1 {
            return Err(StoreError::Invalid(format!(
                "{instance} has {} active disks",
                active.len()
            )));
        }
        Ok(active.pop())
    }

    pub fn inactive_disks(&self, instance: &InstanceId) -> Result<Vec<DiskRecord>, StoreError> {
        Ok(self
            .disks(instance)?
            .into_iter()
            .filter(|d| !d.active)
            .collect())
    }

    pub fn count_active_disks(&self, instance: &InstanceId) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        count_active_in(&conn, instance)
    }

    /// Makes `new` the active disk of the instance in place of `old`.
    ///
    /// Fails without changing anything if the result would not leave exactly
    /// one active disk (or none, when `new` is `None`).
    pub fn commit_activation(&self, pending: PendingActivation) -> Result<(), StoreError> {
        let instance = pending.instance.to_string();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        if let Some(old) = &pending.old {
            tx.execute(
                "UPDATE persistent_disks SET active = 0 WHERE id = ?1 AND instance_id = ?2",
                params![old.to_string(), instance],
            )?;
        }

        if let Some(new) = &pending.new {
            let updated = tx.execute(
                "UPDATE persistent_disks SET active = 1 WHERE id = ?1 AND instance_id = ?2",
                params![new.to_string(), instance],
            )?;
            if updated != 1 {
                return Err(StoreError::NotFound(new.to_string()));
            }
        }

        let active = count_active_in(&tx, &pending.instance)?;
        let expected = usize::from(pending.new.is_some());
        if active != expected {
            return Err(StoreError::Invalid(format!(
                "{instance} would have {active} active disks after swap"
            )));
        }

        tx.commit()?;
        debug!(
            instance = %pending.instance,
            old = ?pending.old,
            new = ?pending.new,
            "Active disk swapped"
        );
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    pub fn insert_snapshot(&self, snapshot: &SnapshotRecord) -> Result<(), StoreError> {
        self.conn()?.execute(
            "INSERT INTO snapshots (id, disk_id, cid, clean, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                snapshot.id.to_string(),
                snapshot.disk.to_string(),
                snapshot.cid.as_str(),
                snapshot.clean,
                snapshot.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn snapshots(&self, disk: &DiskId) -> Result<Vec<SnapshotRecord>, StoreError> {
        let conn = self.conn()?;
        snapshots_in(&conn, disk)
    }

    // -------------------------------------------------------------------------
    // Orphans
    // -------------------------------------------------------------------------

    /// Moves a disk and its snapshots to the orphan tables.
    ///
    /// All or nothing: a snapshot cid that already exists among orphan
    /// snapshots aborts the whole move.
    pub fn orphan_disk(&self, id: &DiskId) -> Result<OrphanDiskRecord, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let disk = disk_in(&tx, id)?.ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let owner = instance_in(&tx, &disk.instance)?
            .ok_or_else(|| StoreError::NotFound(disk.instance.to_string()))?;
        let now = chrono::Utc::now().timestamp();

        let orphan = OrphanDiskRecord {
            id: OrphanDiskId::new(),
            cid: disk.cid.clone(),
            size_mb: disk.size_mb,
            cloud_properties: disk.cloud_properties.clone(),
            availability_zone: owner.availability_zone.clone(),
            deployment: owner.deployment.clone(),
            instance_name: owner.name(),
            created_at: now,
        };

        tx.execute(
            r#"
            INSERT INTO orphan_disks
                (id, cid, size_mb, cloud_properties, availability_zone, deployment, instance_name, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                orphan.id.to_string(),
                orphan.cid.as_str(),
                orphan.size_mb as i64,
                orphan.cloud_properties.to_string(),
                orphan.availability_zone,
                orphan.deployment,
                orphan.instance_name,
                orphan.created_at,
            ],
        )?;

        for snapshot in snapshots_in(&tx, id)? {
            tx.execute(
                r#"
                INSERT INTO orphan_snapshots
                    (id, orphan_disk_id, cid, clean, snapshot_created_at, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    snapshot.id.to_string(),
                    orphan.id.to_string(),
                    snapshot.cid.as_str(),
                    snapshot.clean,
                    snapshot.created_at,
                    now,
                ],
            )?;
        }

        tx.execute("DELETE FROM snapshots WHERE disk_id = ?1", params![id.to_string()])?;
        tx.execute(
            "DELETE FROM persistent_disks WHERE id = ?1",
            params![id.to_string()],
        )?;
        tx.commit()?;

        info!(
            disk = %orphan.cid,
            instance = %orphan.instance_name,
            orphan_id = %orphan.id,
            "Disk orphaned"
        );
        Ok(orphan)
    }

    /// Orphan disks, oldest first.
    pub fn list_orphan_disks(&self) -> Result<Vec<OrphanDiskRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, cid, size_mb, cloud_properties, availability_zone, deployment, instance_name, created_at
             FROM orphan_disks ORDER BY created_at, id",
        )?;
        let orphans = stmt
            .query_map([], orphan_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(orphans)
    }

    pub fn orphan_snapshots(
        &self,
        orphan: &OrphanDiskId,
    ) -> Result<Vec<OrphanSnapshotRecord>, StoreError> {
        let conn = self.conn()?;
        orphan_snapshots_in(&conn, orphan)
    }

    /// Gives an orphan disk back to an instance as an inactive disk.
    pub fn unorphan_disk(
        &self,
        orphan: &OrphanDiskId,
        instance: &InstanceId,
    ) -> Result<DiskRecord, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let record = tx
            .query_row(
                "SELECT id, cid, size_mb, cloud_properties, availability_zone, deployment, instance_name, created_at
                 FROM orphan_disks WHERE id = ?1",
                params![orphan.to_string()],
                orphan_from_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(orphan.to_string()))?;

        let disk = DiskRecord {
            id: DiskId::new(),
            instance: *instance,
            cid: record.cid.clone(),
            size_mb: record.size_mb,
            cloud_properties: record.cloud_properties.clone(),
            active: false,
        };

        tx.execute(
            r#"
            INSERT INTO persistent_disks (id, instance_id, cid, size_mb, cloud_properties, active)
            VALUES (?1, ?2, ?3, ?4, ?5, 0)
            "#,
            params![
                disk.id.to_string(),
                instance.to_string(),
                disk.cid.as_str(),
                disk.size_mb as i64,
                disk.cloud_properties.to_string(),
            ],
        )?;

        for snapshot in orphan_snapshots_in(&tx, orphan)? {
            tx.execute(
                "INSERT INTO snapshots (id, disk_id, cid, clean, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    snapshot.id.to_string(),
                    disk.id.to_string(),
                    snapshot.cid.as_str(),
                    snapshot.clean,
                    snapshot.snapshot_created_at,
                ],
            )?;
        }

        tx.execute(
            "DELETE FROM orphan_snapshots WHERE orphan_disk_id = ?1",
            params![orphan.to_string()],
        )?;
        tx.execute(
            "DELETE FROM orphan_disks WHERE id = ?1",
            params![orphan.to_string()],
        )?;
        tx.commit()?;

        info!(disk = %disk.cid, instance = %instance, "Orphan disk restored");
        Ok(disk)
    }
}

// =============================================================================
// Row helpers
// =============================================================================

fn parsed<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn json(row: &Row<'_>, idx: usize) -> rusqlite::Result<serde_json::Value> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn size(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let raw: i64 = row.get(idx)?;
    u64::try_from(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, Box::new(e)))
}

fn instance_in(conn: &Connection, id: &InstanceId) -> Result<Option<InstanceRecord>, StoreError> {
    conn.query_row(
        "SELECT id, deployment, group_name, idx, availability_zone, state FROM instances WHERE id = ?1",
        params![id.to_string()],
        |row| {
            let state: String = row.get(5)?;
            let state = TargetState::from_str(&state).ok_or_else(|| {
                rusqlite::Error::FromSqlConversionFailure(
                    5,
                    Type::Text,
                    format!("unknown instance state {state}").into(),
                )
            })?;
            Ok(InstanceRecord {
                id: parsed(row, 0)?,
                deployment: row.get(1)?,
                group: row.get(2)?,
                index: row.get(3)?,
                availability_zone: row.get(4)?,
                state,
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

fn disk_from_row(row: &Row<'_>) -> rusqlite::Result<DiskRecord> {
    Ok(DiskRecord {
        id: parsed(row, 0)?,
        instance: parsed(row, 1)?,
        cid: parsed(row, 2)?,
        size_mb: size(row, 3)?,
        cloud_properties: json(row, 4)?,
        active: row.get(5)?,
    })
}

fn disk_in(conn: &Connection, id: &DiskId) -> Result<Option<DiskRecord>, StoreError> {
    conn.query_row(
        "SELECT id, instance_id, cid, size_mb, cloud_properties, active
         FROM persistent_disks WHERE id = ?1",
        params![id.to_string()],
        disk_from_row,
    )
    .optional()
    .map_err(Into::into)
}

fn count_active_in(conn: &Connection, instance: &InstanceId) -> Result<usize, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM persistent_disks WHERE instance_id = ?1 AND active = 1",
        params![instance.to_string()],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

fn snapshots_in(conn: &Connection, disk: &DiskId) -> Result<Vec<SnapshotRecord>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, disk_id, cid, clean, created_at FROM snapshots WHERE disk_id = ?1 ORDER BY id",
    )?;
    let snapshots = stmt
        .query_map(params![disk.to_string()], |row| {
            Ok(SnapshotRecord {
                id: parsed(row, 0)?,
                disk: parsed(row, 1)?,
                cid: parsed(row, 2)?,
                clean: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(snapshots)
}

fn orphan_from_row(row: &Row<'_>) -> rusqlite::Result<OrphanDiskRecord> {
    Ok(OrphanDiskRecord {
        id: parsed(row, 0)?,
        cid: parsed(row, 1)?,
        size_mb: size(row, 2)?,
        cloud_properties: json(row, 3)?,
        availability_zone: row.get(4)?,
        deployment: row.get(5)?,
        instance_name: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn orphan_snapshots_in(
    conn: &Connection,
    orphan: &OrphanDiskId,
) -> Result<Vec<OrphanSnapshotRecord>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, orphan_disk_id, cid, clean, snapshot_created_at, created_at
         FROM orphan_snapshots WHERE orphan_disk_id = ?1 ORDER BY id",
    )?;
    let snapshots = stmt
        .query_map(params![orphan.to_string()], |row| {
            Ok(OrphanSnapshotRecord {
                id: parsed(row, 0)?,
                orphan_disk: parsed(row, 1)?,
                cid: parsed(row, 2)?,
                clean: row.get(3)?,
                snapshot_created_at: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(snapshots)
}
