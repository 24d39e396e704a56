//! VPN key material pools
//!
//! Two pool shapes over the shared key tables: a centralized pool (one hub
//! keypair, one keypair per spoke, one PSK per hub/spoke pair) used by the
//! root VPN and every particles VPN, and a paired pool (two keypairs and one
//! PSK per unordered cell pair) used by the backbone.
//!
//! A pool's `prefix` fully qualifies its namespace: pools with different
//! prefixes never collide. On a readonly store mutators are no-ops and
//! lookups of absent material raise `MissingKeyMaterial`.

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;
use uvnet_common::types::ObjectId;
use uvnet_common::{Database, Error, Result, WgKeyPair, WgPsk};

/// Canonical unordered pair key: `(min, max)`
pub fn pair_key(a: ObjectId, b: ObjectId) -> (ObjectId, ObjectId) {
    (a.min(b), a.max(b))
}

fn missing(prefix: &str, scope: impl std::fmt::Display) -> Error {
    Error::MissingKeyMaterial {
        prefix: prefix.to_string(),
        scope: scope.to_string(),
    }
}

fn load_keypair(
    conn: &Connection,
    key_id: &str,
    prefer_dropped: bool,
) -> Result<Option<WgKeyPair>> {
    // The active view only sees dropped = 0; the rekey view resolves the
    // dropped row first and falls back to the active one
    let sql = if prefer_dropped {
        "SELECT key_id, public, private, dropped FROM asymm_keys \
         WHERE key_id = ?1 ORDER BY dropped DESC LIMIT 1"
    } else {
        "SELECT key_id, public, private, dropped FROM asymm_keys \
         WHERE key_id = ?1 AND dropped = 0"
    };
    let key = conn
        .query_row(sql, params![key_id], |row| {
            Ok(WgKeyPair {
                key_id: row.get(0)?,
                public: row.get(1)?,
                private: row.get(2)?,
                dropped: row.get(3)?,
            })
        })
        .optional()?;
    Ok(key)
}

fn load_keypairs_like(
    conn: &Connection,
    pattern: &str,
    prefer_dropped: bool,
) -> Result<Vec<WgKeyPair>> {
    let sql = if prefer_dropped {
        "SELECT key_id, public, private, dropped FROM asymm_keys WHERE key_id LIKE ?1"
    } else {
        "SELECT key_id, public, private, dropped FROM asymm_keys \
         WHERE key_id LIKE ?1 AND dropped = 0"
    };
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params![pattern], |row| {
        Ok(WgKeyPair {
            key_id: row.get(0)?,
            public: row.get(1)?,
            private: row.get(2)?,
            dropped: row.get(3)?,
        })
    })?;
    // One visible key per id; the preferred flavor wins
    let mut by_id: BTreeMap<String, WgKeyPair> = BTreeMap::new();
    for row in rows {
        let key = row?;
        match by_id.get(&key.key_id) {
            Some(existing) if existing.dropped == prefer_dropped => {}
            _ => {
                if key.dropped == prefer_dropped || !by_id.contains_key(&key.key_id) {
                    by_id.insert(key.key_id.clone(), key);
                }
            }
        }
    }
    Ok(by_id.into_values().collect())
}

fn load_psk(conn: &Connection, key_id: &str, prefer_dropped: bool) -> Result<Option<WgPsk>> {
    let sql = if prefer_dropped {
        "SELECT key_id, value, dropped FROM symm_keys \
         WHERE key_id = ?1 ORDER BY dropped DESC LIMIT 1"
    } else {
        "SELECT key_id, value, dropped FROM symm_keys WHERE key_id = ?1 AND dropped = 0"
    };
    let psk = conn
        .query_row(sql, params![key_id], |row| {
            Ok(WgPsk {
                key_id: row.get(0)?,
                value: row.get(1)?,
                dropped: row.get(2)?,
            })
        })
        .optional()?;
    Ok(psk)
}

fn insert_keypair(conn: &Connection, key: &WgKeyPair) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO asymm_keys (key_id, public, private, dropped) \
         VALUES (?1, ?2, ?3, ?4)",
        params![key.key_id, key.public, key.private, key.dropped],
    )?;
    Ok(())
}

fn insert_psk(conn: &Connection, psk: &WgPsk) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO symm_keys (key_id, value, dropped) VALUES (?1, ?2, ?3)",
        params![psk.key_id, psk.value, psk.dropped],
    )?;
    Ok(())
}

/// Insert a keypair row into a store, used when building package exports
pub fn store_keypair(db: &Database, key: &WgKeyPair) -> Result<()> {
    let conn = db.connection();
    let conn = conn.lock();
    insert_keypair(&conn, key)
}

/// Insert a PSK row into a store, used when building package exports
pub fn store_psk(db: &Database, psk: &WgPsk) -> Result<()> {
    let conn = db.connection();
    let conn = conn.lock();
    insert_psk(&conn, psk)
}

/// Mark matching keys as dropped (retained), or delete them outright
fn drop_rows(conn: &Connection, table: &str, pattern: &str, delete: bool) -> Result<usize> {
    if delete {
        let n = conn.execute(
            &format!("DELETE FROM {} WHERE key_id LIKE ?1", table),
            params![pattern],
        )?;
        return Ok(n);
    }
    // Primary key is (key_id, dropped): clear any stale dropped twin first
    conn.execute(
        &format!(
            "DELETE FROM {} WHERE key_id LIKE ?1 AND dropped = 1 \
             AND key_id IN (SELECT key_id FROM {} WHERE key_id LIKE ?1 AND dropped = 0)",
            table, table
        ),
        params![pattern],
    )?;
    let n = conn.execute(
        &format!("UPDATE {} SET dropped = 1 WHERE key_id LIKE ?1 AND dropped = 0", table),
        params![pattern],
    )?;
    Ok(n)
}

/// Centralized pool: hub key, spoke keys, hub/spoke PSKs
#[derive(Clone)]
pub struct CentralizedVpnKeys {
    db: Database,
    prefix: String,
    prefer_dropped: bool,
}

impl CentralizedVpnKeys {
    pub fn new(db: Database, prefix: impl Into<String>) -> Self {
        Self {
            db,
            prefix: prefix.into(),
            prefer_dropped: false,
        }
    }

    /// A view that resolves to dropped material first, used while a rekey is
    /// in flight to keep talking to agents holding the previous config
    pub fn prefer_dropped(mut self) -> Self {
        self.prefer_dropped = true;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn root_id(&self) -> String {
        format!("{}:root", self.prefix)
    }

    fn peer_id(&self, peer: ObjectId) -> String {
        format!("{}:peer:{}", self.prefix, peer)
    }

    fn psk_id(&self, peer: ObjectId) -> String {
        let (a, b) = pair_key(0, peer);
        format!("{}:psks:{}-{}", self.prefix, a, b)
    }

    pub fn root_key(&self) -> Result<Option<WgKeyPair>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        load_keypair(&conn, &self.root_id(), self.prefer_dropped)
    }

    pub fn peer_key(&self, peer: ObjectId) -> Result<Option<WgKeyPair>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        load_keypair(&conn, &self.peer_id(peer), self.prefer_dropped)
    }

    pub fn psk(&self, peer: ObjectId) -> Result<Option<WgPsk>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        load_psk(&conn, &self.psk_id(peer), self.prefer_dropped)
    }

    /// All spoke keys currently visible, keyed by peer id
    pub fn peer_keys(&self) -> Result<BTreeMap<ObjectId, WgKeyPair>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let prefix = format!("{}:peer:", self.prefix);
        let keys = load_keypairs_like(&conn, &format!("{}%", prefix), self.prefer_dropped)?;
        let mut out = BTreeMap::new();
        for key in keys {
            if let Ok(peer) = key.key_id[prefix.len()..].parse::<ObjectId>() {
                out.insert(peer, key);
            }
        }
        Ok(out)
    }

    /// Ensure hub and spoke material exists for every listed peer.
    /// On a readonly store, absent material raises `MissingKeyMaterial`.
    pub fn assert_keys(&self, peer_ids: &BTreeSet<ObjectId>) -> Result<bool> {
        if self.db.readonly() {
            if self.root_key()?.is_none() {
                return Err(missing(&self.prefix, "root"));
            }
            for peer in peer_ids {
                if self.peer_key(*peer)?.is_none() || self.psk(*peer)?.is_none() {
                    return Err(missing(&self.prefix, format!("peer:{peer}")));
                }
            }
            return Ok(false);
        }
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut changed = false;
        if load_keypair(&conn, &self.root_id(), false)?.is_none() {
            let key = WgKeyPair::generate(self.root_id());
            debug!("generated root key: {}", key.key_id);
            insert_keypair(&conn, &key)?;
            changed = true;
        }
        for peer in peer_ids {
            if load_keypair(&conn, &self.peer_id(*peer), false)?.is_none() {
                let key = WgKeyPair::generate(self.peer_id(*peer));
                debug!("generated peer key: {}", key.key_id);
                insert_keypair(&conn, &key)?;
                changed = true;
            }
            if load_psk(&conn, &self.psk_id(*peer), false)?.is_none() {
                let psk = WgPsk::generate(self.psk_id(*peer));
                debug!("generated psk: {}", psk.key_id);
                insert_psk(&conn, &psk)?;
                changed = true;
            }
        }
        Ok(changed)
    }

    /// Drop material for peers no longer present. Returns the purged ids.
    pub fn purge_gone_peers(
        &self,
        keep: &BTreeSet<ObjectId>,
        delete: bool,
    ) -> Result<Vec<ObjectId>> {
        if self.db.readonly() {
            return Ok(Vec::new());
        }
        let present: Vec<ObjectId> = self.peer_keys()?.into_keys().collect();
        let mut purged = Vec::new();
        let conn = self.db.connection();
        let conn = conn.lock();
        for peer in present {
            if keep.contains(&peer) {
                continue;
            }
            debug!("purging gone peer from {}: {}", self.prefix, peer);
            drop_rows(&conn, "asymm_keys", &self.peer_id(peer), delete)?;
            drop_rows(&conn, "symm_keys", &self.psk_id(peer), delete)?;
            purged.push(peer);
        }
        Ok(purged)
    }

    /// Empty the active set. Returns the number of keys dropped.
    pub fn drop_keys(&self, delete: bool) -> Result<usize> {
        if self.db.readonly() {
            return Ok(0);
        }
        let conn = self.db.connection();
        let conn = conn.lock();
        let pattern = format!("{}:%", self.prefix);
        let mut count = drop_rows(&conn, "asymm_keys", &pattern, delete)?;
        count += drop_rows(&conn, "symm_keys", &pattern, delete)?;
        debug!("dropped all ({}) keys under {}", count, self.prefix);
        Ok(count)
    }

    /// Remove every retained dropped row under this prefix
    pub fn clean_dropped_keys(&self) -> Result<usize> {
        if self.db.readonly() {
            return Ok(0);
        }
        let conn = self.db.connection();
        let conn = conn.lock();
        let pattern = format!("{}:%", self.prefix);
        let mut count = conn.execute(
            "DELETE FROM asymm_keys WHERE key_id LIKE ?1 AND dropped = 1",
            params![pattern],
        )?;
        count += conn.execute(
            "DELETE FROM symm_keys WHERE key_id LIKE ?1 AND dropped = 1",
            params![pattern],
        )?;
        Ok(count)
    }

    /// Spoke ids whose visible key is a retained dropped key
    pub fn peers_with_dropped_key(&self) -> Result<BTreeSet<ObjectId>> {
        Ok(self
            .peer_keys()?
            .into_iter()
            .filter(|(_, key)| key.dropped)
            .map(|(peer, _)| peer)
            .collect())
    }

    /// Key material visible to one endpoint of the centralized VPN.
    /// Peer 0 is the hub.
    pub fn get_peer_material(&self, peer: ObjectId, private: bool) -> Result<Vec<Material>> {
        let mut out = Vec::new();
        if peer == 0 {
            if private {
                let root = self.root_key()?.ok_or_else(|| missing(&self.prefix, "root"))?;
                out.push(Material::Key(root));
                for (id, _) in self.peer_keys()? {
                    let psk = self
                        .psk(id)?
                        .ok_or_else(|| missing(&self.prefix, format!("psks:0-{id}")))?;
                    out.push(Material::Psk(psk));
                }
            } else {
                for (_, key) in self.peer_keys()? {
                    out.push(Material::Key(key.public_only()));
                }
            }
        } else if private {
            let key = self
                .peer_key(peer)?
                .ok_or_else(|| missing(&self.prefix, format!("peer:{peer}")))?;
            out.push(Material::Key(key));
            let psk = self
                .psk(peer)?
                .ok_or_else(|| missing(&self.prefix, format!("psks:0-{peer}")))?;
            out.push(Material::Psk(psk));
        } else {
            let root = self.root_key()?.ok_or_else(|| missing(&self.prefix, "root"))?;
            out.push(Material::Key(root.public_only()));
        }
        Ok(out)
    }
}

/// A key or a PSK, as returned by material queries
#[derive(Debug, Clone)]
pub enum Material {
    Key(WgKeyPair),
    Psk(WgPsk),
}

/// Material of one backbone link
#[derive(Debug, Clone)]
pub struct PairMaterial {
    /// Keypairs in canonical order: `.0` belongs to the lower id
    pub keys: (WgKeyPair, WgKeyPair),
    pub psk: WgPsk,
}

impl PairMaterial {
    /// The keypair owned by `peer` within its pair; the lower id owns `.0`
    pub fn key_of(&self, peer: ObjectId, other: ObjectId) -> &WgKeyPair {
        if peer < other {
            &self.keys.0
        } else {
            &self.keys.1
        }
    }
}

/// Paired pool: two keypairs plus one PSK per unordered peer pair
#[derive(Clone)]
pub struct PairedVpnKeys {
    db: Database,
    prefix: String,
}

impl PairedVpnKeys {
    pub fn new(db: Database, prefix: impl Into<String>) -> Self {
        Self {
            db,
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn pair_id(&self, a: ObjectId, b: ObjectId, i: usize) -> String {
        let (a, b) = pair_key(a, b);
        format!("{}:pair:{}-{}:{}", self.prefix, a, b, i)
    }

    fn psk_id(&self, a: ObjectId, b: ObjectId) -> String {
        let (a, b) = pair_key(a, b);
        format!("{}:psks:{}-{}", self.prefix, a, b)
    }

    /// Existing material for the unordered pair, or fresh material on a
    /// writable store. Returns whether anything was generated.
    pub fn assert_pair(&self, a: ObjectId, b: ObjectId) -> Result<(PairMaterial, bool)> {
        if self.db.readonly() {
            return Ok((self.get_pair_material(a, b)?, false));
        }
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut asserted = false;
        let mut keys = Vec::with_capacity(2);
        for i in 0..2 {
            let id = self.pair_id(a, b, i);
            match load_keypair(&conn, &id, false)? {
                Some(key) => keys.push(key),
                None => {
                    let key = WgKeyPair::generate(&id);
                    insert_keypair(&conn, &key)?;
                    keys.push(key);
                    asserted = true;
                }
            }
        }
        let psk_id = self.psk_id(a, b);
        let psk = match load_psk(&conn, &psk_id, false)? {
            Some(psk) => psk,
            None => {
                let psk = WgPsk::generate(&psk_id);
                insert_psk(&conn, &psk)?;
                asserted = true;
                psk
            }
        };
        if asserted {
            debug!("asserted pair material: {}", self.pair_id(a, b, 0));
        }
        let mut keys = keys.into_iter();
        Ok((
            PairMaterial {
                keys: (keys.next().unwrap(), keys.next().unwrap()),
                psk,
            },
            asserted,
        ))
    }

    /// Existing material for the unordered pair; `MissingKeyMaterial` if absent
    pub fn get_pair_material(&self, a: ObjectId, b: ObjectId) -> Result<PairMaterial> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let key0 = load_keypair(&conn, &self.pair_id(a, b, 0), false)?;
        let key1 = load_keypair(&conn, &self.pair_id(a, b, 1), false)?;
        let psk = load_psk(&conn, &self.psk_id(a, b), false)?;
        match (key0, key1, psk) {
            (Some(key0), Some(key1), Some(psk)) => Ok(PairMaterial {
                keys: (key0, key1),
                psk,
            }),
            _ => {
                let (a, b) = pair_key(a, b);
                Err(missing(&self.prefix, format!("pair:{a}-{b}")))
            }
        }
    }

    /// All pairs currently present under this prefix
    pub fn pairs(&self) -> Result<BTreeSet<(ObjectId, ObjectId)>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let prefix = format!("{}:pair:", self.prefix);
        let keys = load_keypairs_like(&conn, &format!("{}%", prefix), false)?;
        let mut out = BTreeSet::new();
        for key in keys {
            let rest = &key.key_id[prefix.len()..];
            if let Some((pair, _)) = rest.rsplit_once(':') {
                if let Some((a, b)) = pair.split_once('-') {
                    if let (Ok(a), Ok(b)) = (a.parse(), b.parse()) {
                        out.insert((a, b));
                    }
                }
            }
        }
        Ok(out)
    }

    /// Drop every entry mentioning `peer`
    pub fn purge_peer(&self, peer: ObjectId, delete: bool) -> Result<usize> {
        if self.db.readonly() {
            return Ok(0);
        }
        let mut purged = 0;
        let pairs = self.pairs()?;
        let conn = self.db.connection();
        let conn = conn.lock();
        for (a, b) in pairs {
            if a != peer && b != peer {
                continue;
            }
            for i in 0..2 {
                purged += drop_rows(&conn, "asymm_keys", &self.pair_id(a, b, i), delete)?;
            }
            purged += drop_rows(&conn, "symm_keys", &self.psk_id(a, b), delete)?;
        }
        if purged > 0 {
            debug!("purged {} paired keys for peer {}", purged, peer);
        }
        Ok(purged)
    }

    pub fn drop_keys(&self, delete: bool) -> Result<usize> {
        if self.db.readonly() {
            return Ok(0);
        }
        let conn = self.db.connection();
        let conn = conn.lock();
        let pattern = format!("{}:%", self.prefix);
        let mut count = drop_rows(&conn, "asymm_keys", &pattern, delete)?;
        count += drop_rows(&conn, "symm_keys", &pattern, delete)?;
        debug!("dropped all ({}) keys under {}", count, self.prefix);
        Ok(count)
    }

    pub fn clean_dropped_keys(&self) -> Result<usize> {
        if self.db.readonly() {
            return Ok(0);
        }
        let conn = self.db.connection();
        let conn = conn.lock();
        let pattern = format!("{}:%", self.prefix);
        let mut count = conn.execute(
            "DELETE FROM asymm_keys WHERE key_id LIKE ?1 AND dropped = 1",
            params![pattern],
        )?;
        count += conn.execute(
            "DELETE FROM symm_keys WHERE key_id LIKE ?1 AND dropped = 1",
            params![pattern],
        )?;
        Ok(count)
    }

    /// Keys visible to one endpoint: its own private halves when `private`,
    /// otherwise the public halves of its remotes
    pub fn get_peer_material(&self, peer: ObjectId, private: bool) -> Result<Vec<Material>> {
        let mut out = Vec::new();
        for (a, b) in self.pairs()? {
            if a != peer && b != peer {
                continue;
            }
            let other = if a == peer { b } else { a };
            let material = self.get_pair_material(a, b)?;
            let key = if private {
                material.key_of(peer, other).clone()
            } else {
                material.key_of(other, peer).public_only()
            };
            out.push(Material::Key(key));
            if private {
                out.push(Material::Psk(material.psk.clone()));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Database {
        Database::open_memory().unwrap()
    }

    #[test]
    fn test_centralized_assert_and_get() {
        let db = db();
        let pool = CentralizedVpnKeys::new(db.clone(), "u1:vpn:root");
        let peers: BTreeSet<ObjectId> = [1, 2].into_iter().collect();
        assert!(pool.assert_keys(&peers).unwrap());
        // Second assert is a no-op
        assert!(!pool.assert_keys(&peers).unwrap());

        let root = pool.root_key().unwrap().unwrap();
        assert_eq!(root.key_id, "u1:vpn:root:root");
        assert!(pool.peer_key(1).unwrap().is_some());
        assert!(pool.psk(2).unwrap().is_some());

        // Spoke view: only the hub public key
        let material = pool.get_peer_material(1, false).unwrap();
        assert_eq!(material.len(), 1);
        match &material[0] {
            Material::Key(key) => {
                assert_eq!(key.public, root.public);
                assert!(key.private.is_empty());
            }
            _ => panic!("expected a key"),
        }

        // Hub private view: root key plus every spoke PSK
        let material = pool.get_peer_material(0, true).unwrap();
        assert_eq!(material.len(), 3);
    }

    #[test]
    fn test_key_namespace_disjointness() {
        let db = db();
        let a = CentralizedVpnKeys::new(db.clone(), "u1:vpn:particles:1");
        let b = CentralizedVpnKeys::new(db.clone(), "u1:vpn:particles:11");
        a.assert_keys(&[5].into_iter().collect()).unwrap();
        b.assert_keys(&[7].into_iter().collect()).unwrap();

        assert_eq!(a.peer_keys().unwrap().len(), 1);
        assert_eq!(b.peer_keys().unwrap().len(), 1);
        a.drop_keys(true).unwrap();
        assert!(a.root_key().unwrap().is_none());
        assert!(b.root_key().unwrap().is_some());
        assert_eq!(b.peer_keys().unwrap().len(), 1);
    }

    #[test]
    fn test_dropped_keys_retained_until_cleaned() {
        let db = db();
        let pool = CentralizedVpnKeys::new(db.clone(), "u1:vpn:root");
        pool.assert_keys(&[1].into_iter().collect()).unwrap();
        let before = pool.root_key().unwrap().unwrap();

        pool.drop_keys(false).unwrap();
        assert!(pool.root_key().unwrap().is_none());

        // The rekey view still resolves the dropped key
        let rekey_view = CentralizedVpnKeys::new(db.clone(), "u1:vpn:root").prefer_dropped();
        let dropped = rekey_view.root_key().unwrap().unwrap();
        assert!(dropped.dropped);
        assert_eq!(dropped.private, before.private);

        pool.clean_dropped_keys().unwrap();
        assert!(rekey_view.root_key().unwrap().is_none());
    }

    #[test]
    fn test_purge_gone_peers() {
        let db = db();
        let pool = CentralizedVpnKeys::new(db.clone(), "u1:vpn:root");
        pool.assert_keys(&[1, 2, 3].into_iter().collect()).unwrap();
        let purged = pool
            .purge_gone_peers(&[1, 3].into_iter().collect(), true)
            .unwrap();
        assert_eq!(purged, vec![2]);
        assert!(pool.peer_key(2).unwrap().is_none());
        assert!(pool.peer_key(1).unwrap().is_some());
    }

    #[test]
    fn test_paired_pool() {
        let db = db();
        let pool = PairedVpnKeys::new(db.clone(), "u1:vpn:backbone");
        let (material, asserted) = pool.assert_pair(3, 1).unwrap();
        assert!(asserted);
        // Canonicalized as (1, 3)
        assert_eq!(material.keys.0.key_id, "u1:vpn:backbone:pair:1-3:0");
        let (again, asserted) = pool.assert_pair(1, 3).unwrap();
        assert!(!asserted);
        assert_eq!(again.keys.0.private, material.keys.0.private);

        // Endpoint key selection: lower id owns keys.0
        assert_eq!(material.key_of(1, 3).key_id, material.keys.0.key_id);
        assert_eq!(material.key_of(3, 1).key_id, material.keys.1.key_id);

        pool.assert_pair(1, 2).unwrap();
        assert_eq!(pool.pairs().unwrap().len(), 2);
        pool.purge_peer(3, true).unwrap();
        assert_eq!(pool.pairs().unwrap().len(), 1);
        assert!(pool.get_pair_material(1, 3).is_err());
    }

    #[test]
    fn test_readonly_store_missing_material() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Database::open(dir.path()).unwrap();
            let pool = PairedVpnKeys::new(db, "u1:vpn:backbone");
            pool.assert_pair(1, 2).unwrap();
        }
        let db = Database::open_readonly(dir.path()).unwrap();
        let pool = PairedVpnKeys::new(db.clone(), "u1:vpn:backbone");
        // Present material resolves
        let (_, asserted) = pool.assert_pair(1, 2).unwrap();
        assert!(!asserted);
        // Absent material raises instead of generating
        let err = pool.assert_pair(1, 3).unwrap_err();
        assert!(matches!(err, Error::MissingKeyMaterial { .. }));
        // Mutators are no-ops
        assert_eq!(pool.drop_keys(true).unwrap(), 0);
        assert!(pool.get_pair_material(1, 2).is_ok());
    }
}
