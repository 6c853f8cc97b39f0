use clap::{Parser as ClapParser, Subcommand};
use std::cell::Cell;
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;

use weft::snapshot::SerializedValue;
use weft::{
    ArtifactId, CacheBuildFailure, FieldDef, GraphSnapshot, RenderBackend, Scene, TypeTag, Value,
};

#[derive(ClapParser)]
#[command(name = "weft")]
#[command(about = "Weft reactive scene-graph CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the spinner demo scene
    Demo {
        /// Number of ticks to run
        #[arg(long)]
        ticks: Option<u64>,
        /// Tick at which the spinner stops animating
        #[arg(long)]
        spin_ticks: Option<u64>,
        /// Rotation speed in degrees per second
        #[arg(long)]
        speed: Option<f64>,
        /// State file for persistence (load on start, save on exit)
        #[arg(long)]
        state: Option<PathBuf>,
    },
    /// Print the contents of a saved graph snapshot
    Inspect {
        /// Path to a snapshot .json file
        file: PathBuf,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Demo {
            ticks,
            spin_ticks,
            speed,
            state,
        } => {
            run_demo(
                ticks.unwrap_or(120),
                spin_ticks.unwrap_or(60),
                speed.unwrap_or(90.0),
                state,
            );
        }
        Commands::Inspect { file } => match fs::read_to_string(&file) {
            Ok(json) => inspect_snapshot(&json),
            Err(e) => {
                eprintln!("Error reading file: {}", e);
                std::process::exit(1);
            }
        },
    }
}

/// Counting backend: artifacts are just ids, compiles and replays are
/// tallied for the end-of-run summary.
#[derive(Default)]
struct DemoBackend {
    next: ArtifactId,
    live: HashSet<ArtifactId>,
    compiles: u32,
    replays: u32,
}

impl RenderBackend for DemoBackend {
    fn begin_compile(&mut self) -> ArtifactId {
        self.next += 1;
        self.next
    }

    fn finish_compile(&mut self, artifact: ArtifactId) -> Result<(), CacheBuildFailure> {
        self.live.insert(artifact);
        self.compiles += 1;
        Ok(())
    }

    fn replay(&mut self, artifact: ArtifactId) -> Result<(), CacheBuildFailure> {
        if !self.live.contains(&artifact) {
            return Err(CacheBuildFailure::new("unknown artifact"));
        }
        self.replays += 1;
        Ok(())
    }

    fn discard(&mut self, artifact: ArtifactId) {
        self.live.remove(&artifact);
    }
}

/// A spinner node whose angle follows the scene clock, drawn through a
/// cache. While the spinner animates, every frame invalidates the cache
/// and renders directly; once it stops, the churn delay drains and the
/// remaining frames replay one compiled list.
fn run_demo(ticks: u64, spin_ticks: u64, speed: f64, state: Option<PathBuf>) {
    // Resume the rotation where a previous run left it.
    let offset = state
        .as_deref()
        .and_then(load_saved_angle)
        .unwrap_or(0.0);

    let mut scene = Scene::new();
    let spinner = scene.graph.register_node("Spinner");
    let angle = scene.graph.add(
        FieldDef::new("angle", TypeTag::Float)
            .owner(spinner)
            .value(Value::Float(offset))
            .map(move |inputs| match inputs[0] {
                Value::Float(t) => Value::Float((offset + t * speed).rem_euclid(360.0)),
                _ => Value::Unit,
            }),
    );

    let renders = Rc::new(Cell::new(0u32));
    let drawn = Rc::new(Cell::new(offset));
    let seen = renders.clone();
    let last = drawn.clone();
    let display = scene.graph.add_cache_field(
        FieldDef::new("display", TypeTag::Any).owner(spinner),
        move |graph, _backend| {
            if let Ok(Value::Float(a)) = graph.get(angle, Some(spinner)) {
                last.set(a);
            }
            seen.set(seen.get() + 1);
        },
    );

    let time = scene.time();
    scene.graph.route(time, angle, None).unwrap();
    scene.graph.route(angle, display, Some(spinner)).unwrap();
    scene.graph.mark_initialized(spinner);

    let mut backend = DemoBackend::default();
    let dt = 1.0 / 60.0;
    for t in 0..ticks {
        scene.tick(dt);
        if t + 1 == spin_ticks {
            log::info!("spinner stopped at tick {}", t + 1);
            scene.graph.unroute(time, angle);
        }
        if let Err(e) = scene.graph.call_list(display, true, &mut backend) {
            eprintln!("Error drawing frame {}: {}", t, e);
            std::process::exit(1);
        }
        log::debug!("tick {} angle {:.2}", t, drawn.get());
    }

    if let Some(ref state_path) = state {
        let snapshot = GraphSnapshot::capture(&scene.graph);
        match snapshot.to_json() {
            Ok(json) => match fs::write(state_path, json) {
                Ok(()) => eprintln!("Saved state to: {}", state_path.display()),
                Err(e) => eprintln!("Warning: Failed to write state file: {}", e),
            },
            Err(e) => eprintln!("Warning: Failed to serialize state: {}", e),
        }
    }

    println!(
        "{}",
        serde_json::json!({
            "status": "ok",
            "ticks": ticks,
            "angle": drawn.get(),
            "renders": renders.get(),
            "compiles": backend.compiles,
            "replays": backend.replays,
            "cache_valid": scene.graph.cache_valid(display),
        })
    );
}

/// Pull the spinner angle out of a previous run's snapshot, if there is one.
fn load_saved_angle(state_path: &std::path::Path) -> Option<f64> {
    if !state_path.exists() {
        return None;
    }
    let json = match fs::read_to_string(state_path) {
        Ok(json) => json,
        Err(e) => {
            eprintln!("Warning: Failed to read state file: {}", e);
            return None;
        }
    };
    let snapshot = match GraphSnapshot::from_json(&json) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            eprintln!("Warning: Failed to parse state file: {}", e);
            return None;
        }
    };
    eprintln!("Loaded state from: {}", state_path.display());
    let spinner = snapshot
        .nodes
        .values()
        .find(|node| node.type_name == "Spinner")?;
    let (_, key) = spinner.fields.iter().find(|(name, _)| name == "angle")?;
    match snapshot.fields.get(key)?.value {
        SerializedValue::Float(angle) => Some(angle),
        _ => None,
    }
}

fn inspect_snapshot(json: &str) {
    let snapshot = match GraphSnapshot::from_json(json) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            eprintln!("Error parsing snapshot: {}", e);
            std::process::exit(1);
        }
    };

    let caches = snapshot
        .fields
        .values()
        .filter(|field| field.cache.is_some())
        .count();
    println!(
        "snapshot v{}: {} fields ({} caches), {} nodes, clock {}",
        snapshot.version,
        snapshot.fields.len(),
        caches,
        snapshot.nodes.len(),
        snapshot.clock,
    );

    let mut nodes: Vec<_> = snapshot.nodes.values().collect();
    nodes.sort_by(|a, b| a.type_name.cmp(&b.type_name));
    for node in nodes {
        let state = if node.initialized { "initialized" } else { "initializing" };
        println!("{} ({})", node.type_name, state);
        for (name, key) in &node.fields {
            match snapshot.fields.get(key) {
                Some(field) => {
                    let marker = if field.cache.is_some() { " [cache]" } else { "" };
                    println!(
                        "  {} ({}) = {:?}, {} in / {} out{}",
                        name,
                        field.tag,
                        field.value,
                        field.routes_in.len(),
                        field.routes_out.len(),
                        marker,
                    );
                }
                None => println!("  {} -> dangling key {}", name, key),
            }
        }
    }

    // Fields owned by no node (roots, free-standing plumbing).
    let claimed: HashSet<&String> = snapshot
        .nodes
        .values()
        .flat_map(|node| node.fields.iter().map(|(_, key)| key))
        .collect();
    let mut free: Vec<_> = snapshot
        .fields
        .iter()
        .filter(|(key, _)| !claimed.contains(key))
        .collect();
    free.sort_by(|(a, _), (b, _)| a.cmp(b));
    if !free.is_empty() {
        println!("unowned:");
        for (key, field) in free {
            println!("  {} {} ({}) = {:?}", key, field.name, field.tag, field.value);
        }
    }
}
