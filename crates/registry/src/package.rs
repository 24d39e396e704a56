//! Per-cell agent packages
//!
//! The registry renders one signed package per cell: a snapshot of the cell's
//! slice of the database (entities, deployment, and only the key material the
//! cell may hold) plus the rendered particle configurations. Cells install a
//! package to bootstrap, and re-install newer ones to reload.

use crate::keymat::store_keypair;
use crate::keymat::store_psk;
use crate::registry::Registry;
use crate::vpn_config;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uvnet_common::types::{cell_enables_particles_vpn, Cell, ObjectId};
use uvnet_common::{Database, Error, ImportSpec, Result, SignedData};

/// File extension of agent packages
pub const PACKAGE_EXT: &str = "uvn-agent";

/// Local identity marker written into an agent root
pub const LOCAL_AGENT_FILENAME: &str = "local_agent.json";
/// Pinned registry signer key inside an agent root
pub const REGISTRY_PUBKEY_FILENAME: &str = "registry.pub";

/// Identity of the agent installed in a root directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalAgentId {
    pub uvn: String,
    pub cell_id: ObjectId,
    pub cell_name: String,
    pub config_id: String,
}

/// Read the local identity marker, if this root belongs to a cell agent
pub fn load_local_id(root: &Path) -> Result<Option<LocalAgentId>> {
    let path = root.join(LOCAL_AGENT_FILENAME);
    if !path.exists() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(&std::fs::read(path)?)?))
}

/// Signed payload of an agent package
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageManifest {
    pub uvn: String,
    pub cell_id: ObjectId,
    pub cell_name: String,
    pub config_id: String,
    /// Base64 snapshot of the cell's database slice
    pub db: String,
    /// Rendered particle configurations, keyed by particle name
    pub particle_configs: BTreeMap<String, String>,
    /// Optional opaque license blob
    pub license: Option<String>,
}

/// A manifest plus the registry's signature
pub type AgentPackage = SignedData<PackageManifest>;

/// Tables a package carries, with their import semantics. Dropped keys are
/// never imported.
fn package_import_specs() -> Vec<ImportSpec<'static>> {
    vec![
        ImportSpec::replace("uvns"),
        ImportSpec::replace("uvns_credentials"),
        ImportSpec::replace("cells"),
        ImportSpec::replace("particles"),
        ImportSpec::replace("users"),
        ImportSpec::replace("registry"),
        ImportSpec::replace("asymm_keys").with_where("dropped = 0"),
        ImportSpec::replace("symm_keys").with_where("dropped = 0"),
    ]
}

/// Build the database slice one cell is allowed to hold
fn export_cell_db(registry: &Registry, cell: &Cell, dir: &Path) -> Result<Database> {
    let export = Database::open(dir)?;
    registry.db().export_tables(
        &export,
        &[
            ("uvns", None),
            ("uvns_credentials", None),
            ("cells", None),
            ("particles", None),
            ("users", None),
            ("registry", None),
            ("id_pool", None),
        ],
    )?;
    // Secrets never leave the registry: strip password digests
    export
        .connection()
        .lock()
        .execute("UPDATE users SET password = ''", [])?;

    // Root VPN: the hub public key, plus the cell's own material
    let root_keys = registry.root_vpn_keys();
    if let Some(root) = root_keys.root_key()? {
        store_keypair(&export, &root.public_only())?;
    }
    if let Some(key) = root_keys.peer_key(cell.id)? {
        store_keypair(&export, &key)?;
    }
    if let Some(psk) = root_keys.psk(cell.id)? {
        store_psk(&export, &psk)?;
    }

    // Backbone: own private halves, remote public halves, link PSKs
    let backbone = registry.backbone_keys();
    for (a, b) in backbone.pairs()? {
        if a != cell.id && b != cell.id {
            continue;
        }
        let material = backbone.get_pair_material(a, b)?;
        let other = if a == cell.id { b } else { a };
        store_keypair(&export, material.key_of(cell.id, other))?;
        store_keypair(&export, &material.key_of(other, cell.id).public_only())?;
        store_psk(&export, &material.psk)?;
    }

    // Particles VPN of this cell: full hub and particle material, so the
    // cell can render and hand out particle configurations
    if cell_enables_particles_vpn(&registry.uvn, cell) {
        let particle_keys = registry.particles_keys(cell.id);
        if let Some(hub) = particle_keys.root_key()? {
            store_keypair(&export, &hub)?;
        }
        for (_, key) in particle_keys.peer_keys()? {
            store_keypair(&export, &key)?;
        }
        for particle_id in registry.particles()?.keys() {
            if let Some(psk) = particle_keys.psk(*particle_id)? {
                store_psk(&export, &psk)?;
            }
        }
    }
    Ok(export)
}

/// Render and sign the package for one cell
pub fn build_cell_package(registry: &Registry, cell: &Cell) -> Result<AgentPackage> {
    let tmp = tempfile::tempdir()?;
    let export = export_cell_db(registry, cell, tmp.path())?;
    let snapshot = tmp.path().join("snapshot.db");
    export.backup_to(&snapshot)?;
    let db_bytes = std::fs::read(&snapshot)?;

    let mut particle_configs = BTreeMap::new();
    if cell_enables_particles_vpn(&registry.uvn, cell) {
        let cells = registry.cells()?;
        let particle_keys = registry.particles_keys(cell.id);
        for particle in registry.particles()?.values() {
            if let Some(config) = vpn_config::particles_vpn_particle(
                &registry.uvn,
                cell,
                &cells,
                particle,
                &particle_keys,
            )? {
                particle_configs.insert(particle.name.clone(), config.render());
            }
        }
    }

    let license = match registry.license_file() {
        Some(path) => Some(BASE64.encode(std::fs::read(path)?)),
        None => None,
    };

    let manifest = PackageManifest {
        uvn: registry.uvn.name.clone(),
        cell_id: cell.id,
        cell_name: cell.name.clone(),
        config_id: registry.config_id(),
        db: BASE64.encode(&db_bytes),
        particle_configs,
        license,
    };
    SignedData::new(manifest, &registry.signing_key()?)
}

/// Write packages for every non-excluded cell under `<root>/cells/<name>/`
pub fn export_cell_packages(registry: &Registry) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    for cell in registry.cells()?.values() {
        let package = build_cell_package(registry, cell)?;
        let dir = registry.root().join("cells").join(&cell.name);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.{}", cell.name, PACKAGE_EXT));
        uvnet_common::exec::write_private(&path, serde_json::to_string(&package)?.as_bytes())?;
        debug!("wrote cell package: {}", path.display());
        written.push(path);
    }
    info!("exported {} cell packages", written.len());
    Ok(written)
}

/// Parse and verify a package from its serialized form
pub fn load_package_bytes(bytes: &[u8]) -> Result<AgentPackage> {
    let package: AgentPackage = serde_json::from_slice(bytes)?;
    package.verify()?;
    Ok(package)
}

/// Parse and verify a package file
pub fn load_package(path: &Path) -> Result<AgentPackage> {
    load_package_bytes(&std::fs::read(path)?)
}

/// Install a verified package under an agent root directory.
///
/// A fresh root receives the database snapshot as-is. An existing root is
/// imported into table by table, with a file-level backup restored on
/// failure so a bad package never corrupts a running agent.
pub fn install_package(package: &AgentPackage, root: &Path) -> Result<()> {
    let manifest = &package.data;
    let db_bytes = BASE64
        .decode(&manifest.db)
        .map_err(|e| Error::InvalidConfig(format!("corrupt package database: {e}")))?;

    std::fs::create_dir_all(root)?;

    // Pin the signer on first install; later packages must match, and a
    // mismatch is rejected before anything is touched
    let pubkey_path = root.join(REGISTRY_PUBKEY_FILENAME);
    if pubkey_path.exists() {
        let pinned = std::fs::read_to_string(&pubkey_path)?;
        if pinned.trim() != package.signer_public_key {
            return Err(Error::Crypto(format!(
                "package signed by unknown registry key: {}",
                package.signer_public_key
            )));
        }
    } else {
        std::fs::write(&pubkey_path, &package.signer_public_key)?;
    }

    let db_path = root.join(uvnet_common::db::DB_NAME);
    if !db_path.exists() {
        std::fs::write(&db_path, &db_bytes)?;
    } else {
        let incoming_dir = tempfile::tempdir()?;
        std::fs::write(incoming_dir.path().join(uvnet_common::db::DB_NAME), &db_bytes)?;
        let incoming = Database::open(incoming_dir.path())?;

        let current = Database::open(root)?;
        let backup = root.join("registry.db.backup");
        current.backup_to(&backup)?;
        if let Err(e) = current.import_other(&incoming, &package_import_specs()) {
            warn!("package import failed, restoring database: {}", e);
            let backup_dir = tempfile::tempdir()?;
            std::fs::copy(&backup, backup_dir.path().join(uvnet_common::db::DB_NAME))?;
            let backup_db = Database::open(backup_dir.path())?;
            let all: Vec<String> = backup_db.table_names()?;
            let specs: Vec<ImportSpec<'_>> =
                all.iter().map(|t| ImportSpec::replace(t.as_str())).collect();
            current.import_other(&backup_db, &specs)?;
            return Err(e);
        }
        std::fs::remove_file(&backup).ok();
    }

    for (name, config) in &manifest.particle_configs {
        let path = root.join("particles").join(format!("{}.conf", name));
        uvnet_common::exec::write_private(&path, config.as_bytes())?;
    }
    if let Some(license) = &manifest.license {
        let bytes = BASE64
            .decode(license)
            .map_err(|e| Error::InvalidConfig(format!("corrupt license blob: {e}")))?;
        std::fs::write(root.join(crate::registry::LICENSE_FILENAME), bytes)?;
    }

    let local_id = LocalAgentId {
        uvn: manifest.uvn.clone(),
        cell_id: manifest.cell_id,
        cell_name: manifest.cell_name.clone(),
        config_id: manifest.config_id.clone(),
    };
    uvnet_common::exec::write_private(
        &root.join(LOCAL_AGENT_FILENAME),
        serde_json::to_string(&local_id)?.as_bytes(),
    )?;
    info!(
        "installed package for cell {} [{}]",
        manifest.cell_name, manifest.config_id
    );
    Ok(())
}
