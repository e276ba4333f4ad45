//! Scene Sync runner
//!
//! Plays a JSON command script against a coordinator wired to a logging
//! scene graph, a filesystem HDR loader and in-process storage, keeps the
//! reactive store in sync, and prints the final snapshot as JSON.
//!
//! A script is a JSON array of command objects (`{"type": "BLOOM.ENABLE"}`)
//! plus two runner directives:
//!
//! ```text
//! {"type": "WAIT", "ms": 150}
//! {"type": "STORE.WRITE", "parameter": "bloom.threshold", "value": 0.3}
//! ```

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::Parser;
use dashmap::DashMap;
use scene_sync::clock::system_clock;
use scene_sync::memory::{InMemoryPersistence, InMemoryReactiveStore};
use scene_sync::services::{HdrAsset, HdrMetadata, MaterialProperty, TextureId};
use scene_sync::sync::{RenderSync, SyncEvent};
use scene_sync::{
    Command, Coordinator, HdrLoader, ObjectGroup, ObjectHandle, Parameter, SceneGraph, Services,
    SyncConfig,
};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "scene-sync")]
#[command(about = "Play a command script through the scene coordinator")]
struct Cli {
    /// JSON array of commands; a built-in demo script runs when omitted
    #[arg(long)]
    script: Option<PathBuf>,

    /// JSON config file; defaults plus SCENE_SYNC_* variables when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory HDR paths are resolved against
    #[arg(long, default_value = ".")]
    hdr_root: PathBuf,

    /// Keep synchronizing after the script until Ctrl-C
    #[arg(long)]
    serve: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,scene_sync=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => SyncConfig::from_json_file(path)?,
        None => SyncConfig::from_env()?,
    };
    let script = match &cli.script {
        Some(path) => {
            let raw = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read script {}", path.display()))?;
            serde_json::from_str::<Vec<Value>>(&raw)
                .with_context(|| format!("script {} is not a JSON array", path.display()))?
        }
        None => demo_script(),
    };

    let storage = Arc::new(InMemoryPersistence::new());
    let services = Services::new(
        Arc::new(TracingScene::with_demo_layout()),
        Arc::new(FsHdrLoader::new(cli.hdr_root.clone())),
        storage.clone(),
    );
    let store = Arc::new(InMemoryReactiveStore::new(system_clock()));
    let coordinator = Coordinator::new(services, config.clone());
    let mut sync = RenderSync::new(coordinator, store.clone(), config.render_sync.clone());

    let report = sync.start().await?;
    info!(
        divergences = report.divergences.len(),
        steps = script.len(),
        "playing script"
    );

    for (index, step) in script.iter().enumerate() {
        play(&mut sync, index, step).await?;
    }

    if cli.serve {
        info!("script finished, synchronizing until Ctrl-C");
        sync.run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    } else {
        sync.reconcile();
        sync.checkpoint().await?;
        sync.stop();
    }
    sync.coordinator().persist_audit().await?;

    let state = sync.state();
    info!(
        conflicts_detected = state.conflicts_detected,
        conflicts_resolved = state.conflicts_resolved,
        blobs = storage.keys().len(),
        "done"
    );
    println!("{}", serde_json::to_string_pretty(&sync.coordinator().snapshot())?);
    Ok(())
}

async fn play(sync: &mut RenderSync, index: usize, step: &Value) -> Result<()> {
    match step.get("type").and_then(Value::as_str) {
        Some("WAIT") => {
            let ms = step.get("ms").and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        Some("STORE.WRITE") => {
            let name = step.get("parameter").and_then(Value::as_str).unwrap_or_default();
            let Some(parameter) = Parameter::ALL.iter().copied().find(|p| p.name() == name) else {
                warn!(index, parameter = name, "unknown parameter, step skipped");
                return Ok(());
            };
            let Some(value) = step.get("value").and_then(Value::as_f64) else {
                warn!(index, "store write without a numeric value, step skipped");
                return Ok(());
            };
            sync.send(SyncEvent::StoreWrite {
                parameter,
                value: value as f32,
            })
            .await?;
        }
        _ => match Command::from_json(step) {
            Some(command) => {
                debug!(index, command = command.kind(), "dispatching");
                sync.send(SyncEvent::Command(command)).await?;
            }
            None => warn!(index, "unrecognized step skipped"),
        },
    }

    // Let service calls started by this step land before the next one.
    sync.coordinator_mut().settle().await;
    for notice in sync.poll().await? {
        info!(?notice, "sync");
    }
    Ok(())
}

fn demo_script() -> Vec<Value> {
    vec![
        json!({ "type": "SYSTEM.REGISTER_OBJECTS", "group": "iris", "handles": [1] }),
        json!({ "type": "BLOOM.ENABLE" }),
        json!({ "type": "PBR.ENABLE" }),
        json!({ "type": "ENV.LOAD_HDR", "path": "studio.hdr" }),
        json!({ "type": "BLOOM.UPDATE_GLOBAL", "threshold": 0.6, "strength": 1.4 }),
        json!({ "type": "PBR.UPDATE_LIGHTING", "ambient": 1.1 }),
        json!({ "type": "STORE.WRITE", "parameter": "bloom.radius", "value": 0.7 }),
        json!({ "type": "WAIT", "ms": 150 }),
        json!({ "type": "SYSTEM.UPDATE_PERFORMANCE", "fps": 58.0, "frameTime": 17.2 }),
        json!({ "type": "SECURITY.SET_SECURITY", "level": "WARNING" }),
        json!({ "type": "WAIT", "ms": 900 }),
        json!({ "type": "SYSTEM.TICK" }),
    ]
}

// =============================================================================
// Scene graph
// =============================================================================

/// Scene graph stand-in that logs every write.
struct TracingScene {
    layout: Vec<(ObjectGroup, ObjectHandle)>,
    registered: DashMap<ObjectHandle, ObjectGroup>,
}

impl TracingScene {
    fn with_demo_layout() -> Self {
        let layout = [
            (ObjectGroup::Iris, 1),
            (ObjectGroup::EyeRings, 2),
            (ObjectGroup::EyeRings, 3),
            (ObjectGroup::RevealRings, 4),
            (ObjectGroup::MagicRings, 5),
            (ObjectGroup::MagicRings, 6),
            (ObjectGroup::Arms, 7),
        ];
        Self {
            layout: layout
                .into_iter()
                .map(|(group, id)| (group, ObjectHandle(id)))
                .collect(),
            registered: DashMap::new(),
        }
    }
}

#[async_trait]
impl SceneGraph for TracingScene {
    fn register_objects(&self, group: ObjectGroup, handles: &[ObjectHandle]) -> Result<()> {
        for handle in handles {
            self.registered.insert(*handle, group);
        }
        info!(%group, count = handles.len(), "scene objects registered");
        Ok(())
    }

    fn unregister_objects(&self, group: ObjectGroup, handles: &[ObjectHandle]) -> Result<()> {
        for handle in handles {
            self.registered.remove(handle);
        }
        info!(%group, count = handles.len(), "scene objects released");
        Ok(())
    }

    fn apply_material_property(
        &self,
        handle: ObjectHandle,
        property: MaterialProperty,
        value: f32,
    ) -> Result<()> {
        if !self.registered.contains_key(&handle) {
            bail!("{handle} is not registered");
        }
        debug!(%handle, %property, value, "material property set");
        Ok(())
    }

    async fn detect_objects(&self) -> Result<Vec<(ObjectGroup, ObjectHandle)>> {
        Ok(self.layout.clone())
    }
}

// =============================================================================
// HDR loader
// =============================================================================

/// Resolves HDR paths under a root directory and reads the Radiance header.
struct FsHdrLoader {
    root: PathBuf,
    next_texture: AtomicU64,
}

impl FsHdrLoader {
    fn new(root: PathBuf) -> Self {
        Self {
            root,
            next_texture: AtomicU64::new(1),
        }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            bail!("HDR path {path} escapes the asset root");
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl HdrLoader for FsHdrLoader {
    async fn load(&self, path: &str) -> Result<HdrAsset> {
        let full = self.resolve(path)?;
        let metadata = tokio::fs::metadata(&full)
            .await
            .with_context(|| format!("HDR file {} not found", full.display()))?;
        if !metadata.is_file() {
            bail!("{} is not a file", full.display());
        }

        let bytes = tokio::fs::read(&full)
            .await
            .with_context(|| format!("failed to read {}", full.display()))?;
        let (width, height) = radiance_resolution(&bytes).unzip();

        Ok(HdrAsset {
            path: path.to_string(),
            texture: TextureId(self.next_texture.fetch_add(1, Ordering::Relaxed)),
            metadata: HdrMetadata {
                width,
                height,
                byte_len: metadata.len(),
            },
        })
    }
}

/// Width and height from a Radiance header (`-Y <h> +X <w>` after the
/// blank line that ends the header).
fn radiance_resolution(bytes: &[u8]) -> Option<(u32, u32)> {
    let head = &bytes[..bytes.len().min(4096)];
    let text = String::from_utf8_lossy(head);
    let mut lines = text.lines();
    if !lines.next()?.starts_with("#?") {
        return None;
    }
    lines.by_ref().find(|line| line.trim().is_empty())?;
    let fields: Vec<&str> = lines.next()?.split_whitespace().collect();
    match fields.as_slice() {
        ["-Y", height, "+X", width] => Some((width.parse().ok()?, height.parse().ok()?)),
        _ => None,
    }
}
