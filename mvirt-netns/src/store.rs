//! Persistent store for network definitions and attachment records.
//!
//! Everything lives in one redb file. The nested bucket hierarchy
//! `<namespace>/managers/<manager>/<network>/<attachment>` is flattened into
//! tuple-keyed tables, so a prefix range over the leading key components
//! enumerates one namespace, one manager or one network:
//!
//! ```text
//! schema          "version"                           -> "v0"
//! v0/networks     (namespace, manager, network)       -> NetworkRecord (JSON)
//! v0/attachments  (namespace, manager, network, id)   -> AttachmentRecord (JSON)
//! v0/leases       (namespace, lease, id)              -> ()
//! ```
//!
//! Every operation takes an optional write transaction. Without one the
//! store opens its own: a read transaction for `get`/`walk`, a write
//! transaction (committed before returning) otherwise.

use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::path::Path;

use chrono::{DateTime, Utc};
use redb::{
    Database, ReadableTable, ReadableTableMetadata, TableDefinition, WriteTransaction,
    backends::InMemoryBackend,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::types::{
    AttachmentArgs, AttachmentRecord, AttachmentStatus, LABEL_LEASE, NetworkConfig,
    NetworkInfo, PluginResult,
};

/// Schema version this build reads and writes.
pub const SCHEMA_VERSION: &str = "v0";

const TABLE_SCHEMA: TableDefinition<&str, &str> = TableDefinition::new("schema");
const TABLE_NETWORKS: TableDefinition<(&str, &str, &str), &[u8]> =
    TableDefinition::new("v0/networks");
const TABLE_ATTACHMENTS: TableDefinition<(&str, &str, &str, &str), &[u8]> =
    TableDefinition::new("v0/attachments");
const TABLE_LEASES: TableDefinition<(&str, &str, &str), ()> = TableDefinition::new("v0/leases");

type NetworkKey = (&'static str, &'static str, &'static str);
type AttachmentTableKey = (&'static str, &'static str, &'static str, &'static str);

/// Persisted network definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRecord {
    pub manager: String,
    pub name: String,
    #[serde(default)]
    pub config: NetworkConfig,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NetworkRecord {
    pub fn info(&self) -> NetworkInfo {
        NetworkInfo {
            manager: self.manager.clone(),
            name: self.name.clone(),
            config: self.config.clone(),
            labels: self.labels.clone(),
        }
    }
}

/// One entry of the lease index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRef {
    pub namespace: String,
    pub lease: String,
    pub attachment: String,
}

pub struct Store {
    db: Database,
}

impl Store {
    /// Opens (or creates) the store file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Internal(format!("create {}: {e}", parent.display())))?;
        }
        let db = Database::create(path)?;
        Self::init(db)
    }

    /// Volatile store, used by tests.
    pub fn in_memory() -> Result<Self> {
        let db = Database::builder().create_with_backend(InMemoryBackend::new())?;
        Self::init(db)
    }

    fn init(db: Database) -> Result<Self> {
        let txn = db.begin_write()?;
        {
            let mut schema = txn.open_table(TABLE_SCHEMA)?;
            let existing = schema.get("version")?.map(|v| v.value().to_string());
            match existing.as_deref() {
                Some(SCHEMA_VERSION) => {}
                Some(other) => {
                    return Err(Error::Internal(format!(
                        "unsupported store schema version {other:?}"
                    )));
                }
                None => {
                    schema.insert("version", SCHEMA_VERSION)?;
                }
            }
            txn.open_table(TABLE_NETWORKS)?;
            txn.open_table(TABLE_ATTACHMENTS)?;
            txn.open_table(TABLE_LEASES)?;
        }
        txn.commit()?;
        Ok(Self { db })
    }

    /// Starts a write transaction to thread through several store calls.
    pub fn begin_write(&self) -> Result<WriteTransaction> {
        Ok(self.db.begin_write()?)
    }

    fn update<T>(
        &self,
        tx: Option<&WriteTransaction>,
        f: impl FnOnce(&WriteTransaction) -> Result<T>,
    ) -> Result<T> {
        if let Some(tx) = tx {
            return f(tx);
        }
        let txn = self.db.begin_write()?;
        match f(&txn) {
            Ok(out) => {
                txn.commit()?;
                Ok(out)
            }
            Err(e) => {
                txn.abort()?;
                Err(e)
            }
        }
    }

    // ========================================================================
    // Networks
    // ========================================================================

    pub fn create_network(
        &self,
        ctx: &Context,
        tx: Option<&WriteTransaction>,
        info: &NetworkInfo,
    ) -> Result<NetworkRecord> {
        let ns = ctx.namespace_required()?;
        self.update(tx, |txn| {
            let mut table = txn.open_table(TABLE_NETWORKS)?;
            let key = (ns, info.manager.as_str(), info.name.as_str());
            if table.get(key)?.is_some() {
                return Err(Error::AlreadyExists(format!(
                    "network {}/{} already exists",
                    info.manager, info.name
                )));
            }
            let now = Utc::now();
            let record = NetworkRecord {
                manager: info.manager.clone(),
                name: info.name.clone(),
                config: info.config.clone(),
                labels: info.labels.clone(),
                created_at: now,
                updated_at: now,
            };
            let data = serde_json::to_vec(&record)?;
            table.insert(key, data.as_slice())?;
            debug!(namespace = ns, manager = %info.manager, network = %info.name, "stored network");
            Ok(record)
        })
    }

    pub fn get_network(
        &self,
        ctx: &Context,
        tx: Option<&WriteTransaction>,
        manager: &str,
        name: &str,
    ) -> Result<NetworkRecord> {
        let ns = ctx.namespace_required()?;
        let key = (ns, manager, name);
        let found = match tx {
            Some(txn) => load_network(&txn.open_table(TABLE_NETWORKS)?, key)?,
            None => {
                let rtx = self.db.begin_read()?;
                load_network(&rtx.open_table(TABLE_NETWORKS)?, key)?
            }
        };
        found.ok_or_else(|| Error::NotFound(format!("network {manager}/{name} not found")))
    }

    pub fn delete_network(
        &self,
        ctx: &Context,
        tx: Option<&WriteTransaction>,
        manager: &str,
        name: &str,
    ) -> Result<()> {
        let ns = ctx.namespace_required()?;
        self.update(tx, |txn| {
            let mut table = txn.open_table(TABLE_NETWORKS)?;
            if table.remove((ns, manager, name))?.is_none() {
                return Err(Error::NotFound(format!("network {manager}/{name} not found")));
            }
            Ok(())
        })
    }

    /// Walks the networks of `manager` in the context namespace.
    pub fn walk_networks(
        &self,
        ctx: &Context,
        tx: Option<&WriteTransaction>,
        manager: &str,
        mut f: impl FnMut(NetworkRecord) -> ControlFlow<()>,
    ) -> Result<()> {
        let ns = ctx.namespace_required()?;
        let mut visit = |(rns, rmanager): (&str, &str), record: NetworkRecord| {
            if rns != ns || rmanager != manager {
                return ControlFlow::Break(());
            }
            f(record)
        };
        let start = (ns, manager, "");
        match tx {
            Some(txn) => scan_networks(&txn.open_table(TABLE_NETWORKS)?, start, &mut visit),
            None => {
                let rtx = self.db.begin_read()?;
                scan_networks(&rtx.open_table(TABLE_NETWORKS)?, start, &mut visit)
            }
        }
    }

    /// Every network of `manager` across all namespaces, as `(namespace, record)`.
    pub fn networks_of_manager(&self, manager: &str) -> Result<Vec<(String, NetworkRecord)>> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(TABLE_NETWORKS)?;
        let mut out = Vec::new();
        for item in table.iter()? {
            let (key, value) = item?;
            let (ns, rmanager, _) = key.value();
            if rmanager == manager {
                out.push((ns.to_string(), serde_json::from_slice(value.value())?));
            }
        }
        Ok(out)
    }

    // ========================================================================
    // Attachments
    // ========================================================================

    /// Persists a new attachment record and its lease index entry.
    pub fn create_attachment(
        &self,
        ctx: &Context,
        tx: Option<&WriteTransaction>,
        manager: &str,
        network: &str,
        record: &AttachmentRecord,
    ) -> Result<()> {
        let ns = ctx.namespace_required()?;
        self.update(tx, |txn| {
            {
                let mut table = txn.open_table(TABLE_ATTACHMENTS)?;
                let key = (ns, manager, network, record.id.as_str());
                if table.get(key)?.is_some() {
                    return Err(Error::AlreadyExists(format!(
                        "attachment {} already exists",
                        record.id
                    )));
                }
                let data = serde_json::to_vec(record)?;
                table.insert(key, data.as_slice())?;
            }
            if let Some(lease) = record.lease() {
                let mut leases = txn.open_table(TABLE_LEASES)?;
                leases.insert((ns, lease, record.id.as_str()), ())?;
            }
            Ok(())
        })
    }

    /// Moves an attachment to `status`, replacing its plugin result.
    ///
    /// All other fields are immutable; `updated_at` is refreshed.
    #[allow(clippy::too_many_arguments)]
    pub fn update_attachment(
        &self,
        ctx: &Context,
        tx: Option<&WriteTransaction>,
        manager: &str,
        network: &str,
        id: &str,
        status: AttachmentStatus,
        result: Option<PluginResult>,
    ) -> Result<AttachmentRecord> {
        let ns = ctx.namespace_required()?;
        self.update(tx, |txn| {
            let mut table = txn.open_table(TABLE_ATTACHMENTS)?;
            let key = (ns, manager, network, id);
            let mut record = load_attachment(&table, key)?
                .ok_or_else(|| Error::NotFound(format!("attachment {id} not found")))?;
            if !record.status.can_transition_to(status) {
                return Err(Error::InvalidArgument(format!(
                    "attachment {id} cannot move from {} to {status}",
                    record.status
                )));
            }
            record.status = status;
            record.result = result;
            record.updated_at = Utc::now().max(record.created_at);
            let data = serde_json::to_vec(&record)?;
            table.insert(key, data.as_slice())?;
            Ok(record)
        })
    }

    pub fn get_attachment(
        &self,
        ctx: &Context,
        tx: Option<&WriteTransaction>,
        manager: &str,
        network: &str,
        id: &str,
    ) -> Result<AttachmentRecord> {
        let ns = ctx.namespace_required()?;
        let key = (ns, manager, network, id);
        let found = match tx {
            Some(txn) => load_attachment(&txn.open_table(TABLE_ATTACHMENTS)?, key)?,
            None => {
                let rtx = self.db.begin_read()?;
                load_attachment(&rtx.open_table(TABLE_ATTACHMENTS)?, key)?
            }
        };
        found.ok_or_else(|| Error::NotFound(format!("attachment {id} not found")))
    }

    /// Deletes an attachment record together with its lease index entry.
    pub fn delete_attachment(
        &self,
        ctx: &Context,
        tx: Option<&WriteTransaction>,
        manager: &str,
        network: &str,
        id: &str,
    ) -> Result<()> {
        let ns = ctx.namespace_required()?;
        self.update(tx, |txn| {
            let removed = {
                let mut table = txn.open_table(TABLE_ATTACHMENTS)?;
                let guard = table.remove((ns, manager, network, id))?;
                match guard {
                    Some(v) => serde_json::from_slice::<AttachmentRecord>(v.value())?,
                    None => return Err(Error::NotFound(format!("attachment {id} not found"))),
                }
            };
            if let Some(lease) = removed.labels.get(LABEL_LEASE) {
                let mut leases = txn.open_table(TABLE_LEASES)?;
                leases.remove((ns, lease.as_str(), id))?;
            }
            Ok(())
        })
    }

    /// Walks the attachments of one network in key order.
    pub fn walk_attachments(
        &self,
        ctx: &Context,
        tx: Option<&WriteTransaction>,
        manager: &str,
        network: &str,
        mut f: impl FnMut(AttachmentRecord) -> ControlFlow<()>,
    ) -> Result<()> {
        let ns = ctx.namespace_required()?;
        let mut visit = |prefix: (&str, &str, &str), record: AttachmentRecord| {
            if prefix != (ns, manager, network) {
                return ControlFlow::Break(());
            }
            f(record)
        };
        let start = (ns, manager, network, "");
        match tx {
            Some(txn) => scan_attachments(&txn.open_table(TABLE_ATTACHMENTS)?, start, &mut visit),
            None => {
                let rtx = self.db.begin_read()?;
                scan_attachments(&rtx.open_table(TABLE_ATTACHMENTS)?, start, &mut visit)
            }
        }
    }

    // ========================================================================
    // Lease index
    // ========================================================================

    /// Attachment IDs owned by `lease` in the context namespace.
    pub fn walk_leased(
        &self,
        ctx: &Context,
        lease: &str,
        mut f: impl FnMut(&str) -> ControlFlow<()>,
    ) -> Result<()> {
        let ns = ctx.namespace_required()?;
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(TABLE_LEASES)?;
        for item in table.range((ns, lease, "")..)? {
            let (key, _) = item?;
            let (kns, klease, id) = key.value();
            if kns != ns || klease != lease {
                break;
            }
            if f(id).is_break() {
                break;
            }
        }
        Ok(())
    }

    /// Snapshot of the whole lease index.
    pub fn lease_refs(&self) -> Result<Vec<LeaseRef>> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(TABLE_LEASES)?;
        let mut out = Vec::with_capacity(table.len()? as usize);
        for item in table.iter()? {
            let (key, _) = item?;
            let (namespace, lease, attachment) = key.value();
            out.push(LeaseRef {
                namespace: namespace.to_string(),
                lease: lease.to_string(),
                attachment: attachment.to_string(),
            });
        }
        Ok(out)
    }

    /// Drops lease index entries pointing at `id`, whatever their lease.
    /// Returns how many were removed.
    pub fn purge_lease_refs(
        &self,
        ctx: &Context,
        tx: Option<&WriteTransaction>,
        id: &str,
    ) -> Result<usize> {
        let ns = ctx.namespace_required()?;
        self.update(tx, |txn| {
            let mut table = txn.open_table(TABLE_LEASES)?;
            let mut stale = Vec::new();
            for item in table.range((ns, "", "")..)? {
                let (key, _) = item?;
                let (kns, lease, kid) = key.value();
                if kns != ns {
                    break;
                }
                if kid == id {
                    stale.push(lease.to_string());
                }
            }
            for lease in &stale {
                table.remove((ns, lease.as_str(), id))?;
            }
            Ok(stale.len())
        })
    }
}

fn load_network(
    table: &impl ReadableTable<NetworkKey, &'static [u8]>,
    key: (&str, &str, &str),
) -> Result<Option<NetworkRecord>> {
    match table.get(key)? {
        Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
        None => Ok(None),
    }
}

fn load_attachment(
    table: &impl ReadableTable<AttachmentTableKey, &'static [u8]>,
    key: (&str, &str, &str, &str),
) -> Result<Option<AttachmentRecord>> {
    match table.get(key)? {
        Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
        None => Ok(None),
    }
}

fn scan_networks(
    table: &impl ReadableTable<NetworkKey, &'static [u8]>,
    start: (&str, &str, &str),
    visit: &mut impl FnMut((&str, &str), NetworkRecord) -> ControlFlow<()>,
) -> Result<()> {
    for item in table.range(start..)? {
        let (key, value) = item?;
        let (ns, manager, _) = key.value();
        let record: NetworkRecord = serde_json::from_slice(value.value())?;
        if visit((ns, manager), record).is_break() {
            break;
        }
    }
    Ok(())
}

fn scan_attachments(
    table: &impl ReadableTable<AttachmentTableKey, &'static [u8]>,
    start: (&str, &str, &str, &str),
    visit: &mut impl FnMut((&str, &str, &str), AttachmentRecord) -> ControlFlow<()>,
) -> Result<()> {
    for item in table.range(start..)? {
        let (key, value) = item?;
        let (ns, manager, network, _) = key.value();
        let record: AttachmentRecord = serde_json::from_slice(value.value())?;
        if visit((ns, manager, network), record).is_break() {
            break;
        }
    }
    Ok(())
}

/// Builds a fresh `Pending` record.
pub fn pending_record(
    id: String,
    args: AttachmentArgs,
    labels: BTreeMap<String, String>,
) -> AttachmentRecord {
    let now = Utc::now();
    AttachmentRecord {
        id,
        args,
        labels,
        status: AttachmentStatus::Pending,
        result: None,
        created_at: now,
        updated_at: now,
    }
}
