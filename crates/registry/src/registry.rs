//! The UVN registry
//!
//! Owns the uvn, its cells, particles and users, the backbone deployment and
//! the key pools, and produces the signed per-cell configuration packages.
//! `generate` is the idempotent maintenance entry point: purge stale keys,
//! redeploy if the topology inputs changed, assert missing material, save.

use crate::keymat::{CentralizedVpnKeys, PairedVpnKeys};
use crate::planner::{self, P2pLinksMap, PlannerInput};
use ipnetwork::Ipv4Network;
use rusqlite::types::Value;
use rusqlite::Row;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uvnet_common::types::{
    cell_enables_particles_vpn, detect_network_clashes, format_network_clashes, Cell, CellSettings,
    ObjectId, Particle, User, Uvn, UvnSettings,
};
use uvnet_common::{Database, Error, KeyPair, Ownable, Record, Result};

/// File name of the registry's package-signing key
pub const SIGNING_KEY_FILENAME: &str = "signing.key";
/// Optional opaque license resource, copied into packages when present
pub const LICENSE_FILENAME: &str = "license.dat";

/// The persisted registry row (always id 1)
#[derive(Debug, Clone)]
pub struct RegistryRecord {
    pub id: ObjectId,
    pub uvn_id: ObjectId,
    pub deployment: Option<P2pLinksMap>,
    pub generation_ts: String,
    /// Root config id active before an in-flight rekey
    pub rekeyed_root_config_id: Option<String>,
    changed: bool,
    readonly: bool,
}

impl RegistryRecord {
    fn new(uvn_id: ObjectId) -> Self {
        Self {
            id: 1,
            uvn_id,
            deployment: None,
            generation_ts: now_ts(),
            rekeyed_root_config_id: None,
            changed: true,
            readonly: false,
        }
    }
}

impl Record for RegistryRecord {
    const TABLE: &'static str = "registry";
    const KIND: &'static str = "registry";
    const COLUMNS: &'static [&'static str] = &[
        "uvn_id",
        "deployment",
        "generation_ts",
        "rekeyed_root_config_id",
    ];

    fn id(&self) -> ObjectId {
        self.id
    }

    fn set_id(&mut self, id: ObjectId) {
        self.id = id;
    }

    fn is_changed(&self) -> bool {
        self.changed
    }

    fn mark_saved(&mut self) {
        self.changed = false;
    }

    fn set_readonly(&mut self, readonly: bool) {
        self.readonly = readonly;
    }

    fn bind(&self) -> Result<Vec<Value>> {
        Ok(vec![
            Value::Integer(self.uvn_id),
            match &self.deployment {
                Some(deployment) => Value::Text(serde_json::to_string(deployment)?),
                None => Value::Null,
            },
            Value::Text(self.generation_ts.clone()),
            self.rekeyed_root_config_id
                .clone()
                .map(Value::Text)
                .unwrap_or(Value::Null),
        ])
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let deployment: Option<String> = row.get(2)?;
        let deployment = match deployment {
            Some(raw) => Some(serde_json::from_str(&raw).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    2,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?),
            None => None,
        };
        Ok(Self {
            id: row.get(0)?,
            uvn_id: row.get(1)?,
            deployment,
            generation_ts: row.get(3)?,
            rekeyed_root_config_id: row.get(4)?,
            changed: false,
            readonly: false,
        })
    }
}

fn now_ts() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

/// Registry over an on-disk database root
pub struct Registry {
    db: Database,
    root: PathBuf,
    pub record: RegistryRecord,
    pub uvn: Uvn,
    deployment_config_dirty: bool,
}

impl Registry {
    /// Initialize a fresh registry directory
    pub fn create(
        root: impl AsRef<Path>,
        name: &str,
        owner: &str,
        password: &str,
        address: Option<String>,
        settings: UvnSettings,
    ) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if root.join(uvnet_common::db::DB_NAME).exists() {
            return Err(Error::AlreadyExists {
                kind: "registry".to_string(),
                id: root.display().to_string(),
            });
        }
        info!("initializing UVN {} in {}", name, root.display());
        let db = Database::open(&root)?;

        let (owner_email, owner_name) = User::parse_user_id(owner)?;
        let owner = db.new_record(User::new(
            owner_email,
            owner_name,
            name.to_string(),
            password,
        ))?;

        let mut uvn = Uvn::new(name.to_string());
        uvn.address = address;
        uvn.settings = settings;
        let uvn = db.new_record(uvn)?;
        db.set_uvn_owner(uvn.id, owner.id)?;

        let mut record = RegistryRecord::new(uvn.id);
        db.save(&mut record)?;

        let signing_key = KeyPair::generate();
        signing_key.save(root.join(SIGNING_KEY_FILENAME))?;
        debug!("registry signing key: {}", signing_key.public_key_hex());

        let mut registry = Self {
            db,
            root,
            record,
            uvn,
            deployment_config_dirty: true,
        };
        registry.generate()?;
        info!("initialized UVN {}: {}", registry.uvn.name, registry.root.display());
        Ok(registry)
    }

    /// Open an existing registry directory
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(Database::open(root.as_ref())?, root)
    }

    /// Open for reading only: mutations are rejected, missing key material
    /// raises instead of generating
    pub fn open_readonly(root: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(Database::open_readonly(root.as_ref())?, root)
    }

    fn open_with(db: Database, root: impl AsRef<Path>) -> Result<Self> {
        let record: RegistryRecord = db.load_required(1)?;
        let uvn: Uvn = db.load_required(record.uvn_id)?;
        Ok(Self {
            db,
            root: root.as_ref().to_path_buf(),
            record,
            uvn,
            deployment_config_dirty: false,
        })
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Content-derived identifier of the current configuration
    pub fn config_id(&self) -> String {
        let mut h = Sha256::new();
        h.update(self.record.generation_ts.as_bytes());
        hex::encode(h.finalize())
    }

    pub fn deployment(&self) -> Option<&P2pLinksMap> {
        self.record.deployment.as_ref()
    }

    pub fn deployed(&self) -> bool {
        self.record.deployment.is_some()
    }

    pub fn needs_redeployment(&self) -> bool {
        !self.deployed() || self.deployment_config_dirty
    }

    /// The registry's package-signing key
    pub fn signing_key(&self) -> Result<KeyPair> {
        KeyPair::load(self.root.join(SIGNING_KEY_FILENAME))
    }

    /// Optional opaque license resource
    pub fn license_file(&self) -> Option<PathBuf> {
        let path = self.root.join(LICENSE_FILENAME);
        path.is_file().then_some(path)
    }

    /// Cache a license file into the registry root
    pub fn set_license_file(&self, source: &Path) -> Result<()> {
        std::fs::copy(source, self.root.join(LICENSE_FILENAME))?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Entity accessors
    // ------------------------------------------------------------------

    pub fn cells(&self) -> Result<BTreeMap<ObjectId, Cell>> {
        Ok(self
            .db
            .load_where::<Cell>("uvn_id = ?1 AND excluded = 0", &[&self.uvn.id])?
            .into_iter()
            .map(|c| (c.id, c))
            .collect())
    }

    pub fn all_cells(&self) -> Result<BTreeMap<ObjectId, Cell>> {
        Ok(self
            .db
            .load_where::<Cell>("uvn_id = ?1", &[&self.uvn.id])?
            .into_iter()
            .map(|c| (c.id, c))
            .collect())
    }

    pub fn particles(&self) -> Result<BTreeMap<ObjectId, Particle>> {
        Ok(self
            .db
            .load_where::<Particle>("uvn_id = ?1 AND excluded = 0", &[&self.uvn.id])?
            .into_iter()
            .map(|p| (p.id, p))
            .collect())
    }

    pub fn all_particles(&self) -> Result<BTreeMap<ObjectId, Particle>> {
        Ok(self
            .db
            .load_where::<Particle>("uvn_id = ?1", &[&self.uvn.id])?
            .into_iter()
            .map(|p| (p.id, p))
            .collect())
    }

    pub fn users(&self) -> Result<BTreeMap<ObjectId, User>> {
        Ok(self
            .db
            .load_where::<User>("realm = ?1", &[&self.uvn.name])?
            .into_iter()
            .map(|u| (u.id, u))
            .collect())
    }

    pub fn uvn_owner(&self) -> Result<User> {
        let owner_id = self
            .db
            .uvn_owner(self.uvn.id)?
            .ok_or_else(|| Error::Internal("uvn has no owner".into()))?;
        self.db.load_required(owner_id)
    }

    pub fn load_cell(&self, name: &str) -> Result<Cell> {
        self.db
            .load_one_where("name = ?1 AND uvn_id = ?2", &[&name, &self.uvn.id])?
            .ok_or_else(|| Error::NotFound {
                kind: "cell".to_string(),
                id: name.to_string(),
            })
    }

    pub fn load_particle(&self, name: &str) -> Result<Particle> {
        self.db
            .load_one_where("name = ?1 AND uvn_id = ?2", &[&name, &self.uvn.id])?
            .ok_or_else(|| Error::NotFound {
                kind: "particle".to_string(),
                id: name.to_string(),
            })
    }

    pub fn load_user(&self, email: &str) -> Result<User> {
        self.db
            .load_one_where("email = ?1 AND realm = ?2", &[&email, &self.uvn.name])?
            .ok_or_else(|| Error::NotFound {
                kind: "user".to_string(),
                id: email.to_string(),
            })
    }

    // ------------------------------------------------------------------
    // Key pools
    // ------------------------------------------------------------------

    pub fn root_vpn_keys(&self) -> CentralizedVpnKeys {
        CentralizedVpnKeys::new(self.db.clone(), format!("{}:vpn:root", self.uvn.name))
    }

    /// Root pool view that resolves dropped material first, valid while a
    /// rekey is in flight
    pub fn rekeyed_root_vpn_keys(&self) -> CentralizedVpnKeys {
        self.root_vpn_keys().prefer_dropped()
    }

    pub fn backbone_keys(&self) -> PairedVpnKeys {
        PairedVpnKeys::new(self.db.clone(), format!("{}:vpn:backbone", self.uvn.name))
    }

    pub fn particles_keys(&self, cell_id: ObjectId) -> CentralizedVpnKeys {
        CentralizedVpnKeys::new(
            self.db.clone(),
            format!("{}:vpn:particles:{}", self.uvn.name, cell_id),
        )
    }

    // ------------------------------------------------------------------
    // Cell operations
    // ------------------------------------------------------------------

    fn validate_cell_networks(
        &self,
        lans: &BTreeSet<Ipv4Network>,
        exclude_cell: Option<ObjectId>,
    ) -> Result<()> {
        if lans.is_empty() {
            return Ok(());
        }
        let existing: Vec<(String, BTreeSet<Ipv4Network>)> = self
            .cells()?
            .into_values()
            .filter(|c| Some(c.id) != exclude_cell)
            .map(|c| (c.name.clone(), c.allowed_lans))
            .collect();
        let clashes = detect_network_clashes(&existing, lans);
        if !clashes.is_empty() {
            return Err(Error::ClashingNetworks(format_network_clashes(&clashes)));
        }
        Ok(())
    }

    pub fn add_cell(
        &mut self,
        name: &str,
        owner: Option<&str>,
        address: Option<String>,
        allowed_lans: BTreeSet<Ipv4Network>,
        settings: CellSettings,
    ) -> Result<Cell> {
        if self.db.load_one_where::<Cell>("name = ?1", &[&name])?.is_some() {
            return Err(Error::AlreadyExists {
                kind: "cell".to_string(),
                id: name.to_string(),
            });
        }
        self.validate_cell_networks(&allowed_lans, None)?;
        let owner = match owner {
            Some(email) => self.load_user(email)?,
            None => self.uvn_owner()?,
        };
        let mut cell = Cell::new(self.uvn.id, name.to_string());
        cell.address = address;
        cell.allowed_lans = allowed_lans;
        cell.settings = settings;
        cell.owner_id = Some(owner.id);
        let cell = self.db.new_record(cell)?;
        self.deployment_config_dirty = true;
        info!("new cell added to {}: {}", self.uvn.name, cell.name);
        Ok(cell)
    }

    pub fn update_cell(
        &mut self,
        name: &str,
        owner: Option<&str>,
        address: Option<Option<String>>,
        allowed_lans: Option<BTreeSet<Ipv4Network>>,
        settings: Option<CellSettings>,
    ) -> Result<Cell> {
        let mut cell = self.load_cell(name)?;
        let mut deployment_changed = false;
        if let Some(lans) = allowed_lans {
            self.validate_cell_networks(&lans, Some(cell.id))?;
            deployment_changed |= cell.set_allowed_lans(lans)?;
        }
        if let Some(address) = address {
            deployment_changed |= cell.set_address(address)?;
        }
        if let Some(settings) = settings {
            cell.set_settings(settings)?;
        }
        if let Some(email) = owner {
            let owner = self.load_user(email)?;
            cell.set_owner_id(Some(owner.id));
        }
        if cell.is_changed() {
            self.db.save(&mut cell)?;
        }
        if deployment_changed {
            self.deployment_config_dirty = true;
        }
        Ok(cell)
    }

    pub fn delete_cell(&mut self, name: &str) -> Result<()> {
        let cell = self.load_cell(name)?;
        self.particles_keys(cell.id).drop_keys(true)?;
        self.db.delete::<Cell>(cell.id)?;
        self.deployment_config_dirty = true;
        info!("cell deleted from uvn {}: {}", self.uvn.name, cell.name);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Particle operations (never affect the deployment)
    // ------------------------------------------------------------------

    pub fn add_particle(&mut self, name: &str, owner: Option<&str>) -> Result<Particle> {
        if self
            .db
            .load_one_where::<Particle>("name = ?1", &[&name])?
            .is_some()
        {
            return Err(Error::AlreadyExists {
                kind: "particle".to_string(),
                id: name.to_string(),
            });
        }
        let owner = match owner {
            Some(email) => self.load_user(email)?,
            None => self.uvn_owner()?,
        };
        let mut particle = Particle::new(self.uvn.id, name.to_string());
        particle.owner_id = Some(owner.id);
        let particle = self.db.new_record(particle)?;
        info!("new particle added to {}: {}", self.uvn.name, particle.name);
        Ok(particle)
    }

    pub fn update_particle(&mut self, name: &str, owner: Option<&str>) -> Result<Particle> {
        let mut particle = self.load_particle(name)?;
        if let Some(email) = owner {
            let owner = self.load_user(email)?;
            particle.set_owner_id(Some(owner.id));
        }
        if particle.is_changed() {
            self.db.save(&mut particle)?;
        }
        Ok(particle)
    }

    pub fn delete_particle(&mut self, name: &str) -> Result<()> {
        let particle = self.load_particle(name)?;
        self.db.delete::<Particle>(particle.id)?;
        info!("particle deleted from uvn {}: {}", self.uvn.name, particle.name);
        Ok(())
    }

    // ------------------------------------------------------------------
    // User operations
    // ------------------------------------------------------------------

    pub fn add_user(&mut self, email: &str, name: &str, password: &str) -> Result<User> {
        if self
            .db
            .load_one_where::<User>("email = ?1", &[&email])?
            .is_some()
        {
            return Err(Error::AlreadyExists {
                kind: "user".to_string(),
                id: email.to_string(),
            });
        }
        let user = self.db.new_record(User::new(
            email.to_string(),
            name.to_string(),
            self.uvn.name.clone(),
            password,
        ))?;
        info!("new user added to {}: {}", self.uvn.name, user.email);
        Ok(user)
    }

    pub fn delete_user(&mut self, email: &str) -> Result<()> {
        let user = self.load_user(email)?;
        if self.db.uvn_owner(self.uvn.id)? == Some(user.id) {
            return Err(Error::InvalidConfig(format!(
                "uvn owner cannot be deleted: {email}"
            )));
        }
        // Reassign owned entities to the uvn owner before deleting
        let uvn_owner = self.uvn_owner()?;
        for mut cell in self
            .db
            .load_where::<Cell>("owner_id = ?1", &[&user.id])?
        {
            cell.set_owner_id(Some(uvn_owner.id));
            self.db.save(&mut cell)?;
        }
        for mut particle in self
            .db
            .load_where::<Particle>("owner_id = ?1", &[&user.id])?
        {
            particle.set_owner_id(Some(uvn_owner.id));
            self.db.save(&mut particle)?;
        }
        self.db.delete::<User>(user.id)?;
        info!("user deleted from uvn {}: {}", self.uvn.name, email);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Ban / unban
    // ------------------------------------------------------------------

    pub fn ban_cell(&mut self, name: &str, banned: bool) -> Result<()> {
        let mut cell = self.load_cell(name)?;
        if cell.set_excluded(banned)? {
            self.db.save(&mut cell)?;
            self.deployment_config_dirty = true;
        }
        Ok(())
    }

    pub fn ban_particle(&mut self, name: &str, banned: bool) -> Result<()> {
        let mut particle = self.load_particle(name)?;
        if particle.set_excluded(banned)? {
            self.db.save(&mut particle)?;
        }
        Ok(())
    }

    /// Ban or unban a user, cascading to their owned cells and particles
    pub fn ban_user(&mut self, email: &str, banned: bool) -> Result<()> {
        let mut user = self.load_user(email)?;
        if self.db.uvn_owner(self.uvn.id)? == Some(user.id) {
            return Err(Error::InvalidConfig(format!(
                "cannot ban or unban the uvn owner: {email}"
            )));
        }
        if user.set_excluded(banned)? {
            self.db.save(&mut user)?;
        }
        for mut cell in self
            .db
            .load_where::<Cell>("owner_id = ?1", &[&user.id])?
        {
            if cell.set_excluded(banned)? {
                self.db.save(&mut cell)?;
                self.deployment_config_dirty = true;
            }
        }
        for mut particle in self
            .db
            .load_where::<Particle>("owner_id = ?1", &[&user.id])?
        {
            if particle.set_excluded(banned)? {
                self.db.save(&mut particle)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Deployment and key maintenance
    // ------------------------------------------------------------------

    fn planner_input(&self) -> Result<PlannerInput> {
        let cells = self.cells()?;
        Ok(PlannerInput {
            peers: cells.keys().copied().collect(),
            private_peers: cells
                .values()
                .filter(|c| c.private())
                .map(|c| c.id)
                .collect(),
        })
    }

    /// Run the planner, replacing the current deployment
    pub fn redeploy(&mut self, drop_keys: bool) -> Result<()> {
        info!("generating new backbone deployment");
        if drop_keys {
            self.backbone_keys().drop_keys(true)?;
        }
        let input = self.planner_input()?;
        let ts = now_ts();
        let deployment = planner::deploy(
            &input,
            self.uvn.settings.backbone_vpn.deployment_strategy,
            &self.uvn.settings.backbone_vpn.deployment_strategy_args,
            self.uvn.settings.backbone_vpn.subnet,
            &ts,
        )?;
        if deployment.is_empty() {
            if input.peers.len() > 1 {
                warn!(
                    "UVN has {} cells but no backbone links",
                    input.peers.len()
                );
            } else {
                warn!("UVN has no backbone");
            }
        } else {
            info!("UVN backbone links updated [{}]", ts);
        }
        self.record.deployment = Some(deployment);
        self.record.generation_ts = ts;
        self.record.changed = true;
        self.deployment_config_dirty = false;
        Ok(())
    }

    /// Drop keys belonging to deleted identities; also resets backbone keys
    /// when a redeployment is pending
    pub fn purge_keys(&mut self) -> Result<bool> {
        let mut changed = false;
        let all_cells: BTreeSet<ObjectId> = self.all_cells()?.keys().copied().collect();
        let all_particles: BTreeSet<ObjectId> = self.all_particles()?.keys().copied().collect();
        changed |= !self
            .root_vpn_keys()
            .purge_gone_peers(&all_cells, true)?
            .is_empty();
        for cell_id in &all_cells {
            changed |= !self
                .particles_keys(*cell_id)
                .purge_gone_peers(&all_particles, true)?
                .is_empty();
        }
        if self.needs_redeployment() {
            changed |= self.backbone_keys().drop_keys(true)? > 0;
        }
        Ok(changed)
    }

    /// Generate all missing key material for live identities
    pub fn assert_keys(&mut self) -> Result<bool> {
        let mut changed = false;
        let cells = self.cells()?;
        let cell_ids: BTreeSet<ObjectId> = cells.keys().copied().collect();
        changed |= self.root_vpn_keys().assert_keys(&cell_ids)?;

        let particle_ids: BTreeSet<ObjectId> = self.particles()?.keys().copied().collect();
        for cell in cells.values() {
            if !cell_enables_particles_vpn(&self.uvn, cell) {
                continue;
            }
            changed |= self.particles_keys(cell.id).assert_keys(&particle_ids)?;
        }

        if let Some(deployment) = self.record.deployment.clone() {
            let backbone = self.backbone_keys();
            for (a, peer) in &deployment.peers {
                for b in peer.peers.keys() {
                    if a < b {
                        let (_, asserted) = backbone.assert_pair(*a, *b)?;
                        changed |= asserted;
                    }
                }
            }
        }
        Ok(changed)
    }

    /// Idempotent maintenance: purge, redeploy if dirty, assert, save.
    /// Returns whether anything changed.
    pub fn generate(&mut self) -> Result<bool> {
        let mut changed = self.purge_keys()?;
        if self.needs_redeployment() {
            // Keys were already dropped as part of purge_keys
            self.redeploy(false)?;
            changed = true;
        }
        changed |= self.assert_keys()?;
        if changed {
            self.record.generation_ts = now_ts();
            self.record.changed = true;
        }
        self.save()?;
        if !changed {
            debug!("registry unchanged");
        }
        Ok(changed)
    }

    /// Persist the registry row and the uvn if dirty
    pub fn save(&mut self) -> Result<()> {
        if self.record.is_changed() {
            self.db.save(&mut self.record)?;
        }
        if self.uvn.is_changed() {
            self.db.save(&mut self.uvn)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Rekey lifecycle
    // ------------------------------------------------------------------

    fn begin_root_rekey(&mut self) {
        if self.record.rekeyed_root_config_id.is_none() {
            self.record.rekeyed_root_config_id = Some(self.config_id());
            self.record.changed = true;
        }
    }

    /// Drop every key of the uvn. Root keys are retained (dropped) until
    /// every cell has adopted the new configuration.
    pub fn rekey_uvn(&mut self) -> Result<()> {
        self.begin_root_rekey();
        self.root_vpn_keys().drop_keys(false)?;
        for cell_id in self.all_cells()?.keys() {
            self.particles_keys(*cell_id).drop_keys(true)?;
        }
        self.backbone_keys().drop_keys(true)?;
        self.generate()?;
        Ok(())
    }

    /// Rekey one cell's root and/or particles material
    pub fn rekey_cell(&mut self, name: &str, root_vpn: bool, particles_vpn: bool) -> Result<()> {
        if !root_vpn && !particles_vpn {
            return Err(Error::InvalidConfig("nothing to rekey".into()));
        }
        let cell = self.load_cell(name)?;
        if root_vpn {
            warn!("dropping root VPN key for cell: {}", cell.name);
            self.begin_root_rekey();
            let keep: BTreeSet<ObjectId> = self
                .cells()?
                .keys()
                .copied()
                .filter(|id| *id != cell.id)
                .collect();
            self.root_vpn_keys().purge_gone_peers(&keep, false)?;
        }
        if particles_vpn {
            self.particles_keys(cell.id).drop_keys(true)?;
        }
        self.generate()?;
        Ok(())
    }

    /// Rekey one particle across every cell's particles VPN
    pub fn rekey_particle(&mut self, name: &str) -> Result<()> {
        let particle = self.load_particle(name)?;
        for cell_id in self.all_cells()?.keys() {
            let keep: BTreeSet<ObjectId> = self
                .all_particles()?
                .keys()
                .copied()
                .filter(|id| *id != particle.id)
                .collect();
            self.particles_keys(*cell_id).purge_gone_peers(&keep, true)?;
        }
        self.generate()?;
        Ok(())
    }

    /// Whether a root rekey is waiting for cells to converge
    pub fn rekeyed_root(&self) -> bool {
        self.record.rekeyed_root_config_id.is_some()
    }

    /// Cells that still hold dropped root material from the previous config
    pub fn rekeyed_cells(&self) -> Result<BTreeSet<ObjectId>> {
        let dropped = self.rekeyed_root_vpn_keys().peers_with_dropped_key()?;
        let cells = self.cells()?;
        Ok(dropped
            .into_iter()
            .filter(|id| cells.contains_key(id))
            .collect())
    }

    /// Discard old root key material once every rekeyed cell has adopted the
    /// new configuration
    pub fn drop_rekeyed(&mut self) -> Result<()> {
        self.root_vpn_keys().clean_dropped_keys()?;
        self.record.rekeyed_root_config_id = None;
        self.record.changed = true;
        self.save()
    }
}
