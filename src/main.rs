use anyhow::{Context, bail};
use env_logger::Builder;
use log::{LevelFilter, error, info, warn};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use dynamic_topology_simulator::config::SimulationConfig;
use dynamic_topology_simulator::scene;
use dynamic_topology_simulator::simulation::{
    BehaviorError, Change, Notification, NodeId, Point, SimulationHandle, Simulator, Subject, TopologyObserver,
};

/// Logs every batch at debug level and a one-line summary per tick.
struct LoggingObserver;

impl TopologyObserver for LoggingObserver {
    fn on_notifications(&self, tick: u64, notifications: &[Notification]) {
        let links_changed = notifications.iter().filter(|n| matches!(n.subject, Subject::Link(_))).count();
        let nodes_changed = notifications
            .iter()
            .filter(|n| matches!(n.subject, Subject::Node(_)) && n.change != Change::Added)
            .count();
        if links_changed > 0 {
            info!("Tick {}: {} link changes, {} node changes", tick, links_changed, nodes_changed);
        }
        for notification in notifications {
            log::debug!("Tick {}: {:?} {:?}", tick, notification.subject, notification.change);
        }
    }

    fn on_behavior_error(&self, error: &BehaviorError) {
        warn!("Behavior error: {}", error);
    }

    fn on_command(&self, command: &str) {
        info!("Operator command: {}", command);
    }
}

struct Arguments {
    scene: Option<String>,
    config: Option<PathBuf>,
}

fn parse_arguments() -> anyhow::Result<Arguments> {
    let mut arguments = Arguments { scene: None, config: None };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let path = args.next().context("--config needs a path")?;
                arguments.config = Some(PathBuf::from(path));
            }
            "-h" | "--help" => {
                println!("Usage: dynamic-topology-simulator [scene.json] [--config config.toml]");
                std::process::exit(0);
            }
            _ if arguments.scene.is_none() => arguments.scene = Some(arg),
            _ => bail!("Unexpected argument: {}", arg),
        }
    }
    Ok(arguments)
}

fn load_config(arguments: &Arguments) -> anyhow::Result<SimulationConfig> {
    let path = match (&arguments.config, &arguments.scene) {
        (Some(path), _) => path.clone(),
        (None, Some(scene)) => {
            let candidate = SimulationConfig::config_path_from_scene(scene);
            if !candidate.exists() {
                return Ok(SimulationConfig::default());
            }
            candidate
        }
        (None, None) => return Ok(SimulationConfig::default()),
    };
    let config = SimulationConfig::load(&path).map_err(anyhow::Error::msg)?;
    info!("Loaded config from {}", path.display());
    Ok(config)
}

fn handle_line(handle: &SimulationHandle, line: &str) -> anyhow::Result<bool> {
    let mut words = line.split_whitespace();
    match words.next() {
        None => {}
        Some("quit") | Some("exit") => return Ok(false),
        Some("add") => {
            let x = words.next().map(str::parse::<f64>).transpose().context("x must be a number")?;
            let y = words.next().map(str::parse::<f64>).transpose().context("y must be a number")?;
            let position = match (x, y) {
                (Some(x), Some(y)) => Some(Point::new(x, y)),
                _ => None,
            };
            let id = handle.add_node(position)?;
            info!("Added node {}", id);
        }
        Some("remove") => {
            let id = parse_node_id(words.next())?;
            if !handle.remove_node(id)? {
                warn!("No node {}", id);
            }
        }
        Some("select") => {
            let id = parse_node_id(words.next())?;
            handle.select_node(id)?;
        }
        Some("save") => {
            let path = words.next().context("save needs a path")?;
            let snapshot = handle.export()?;
            scene::save_scene(path, &snapshot)?;
            info!("Saved {} nodes to {}", snapshot.nodes.len(), path);
        }
        Some(_) => handle.dispatch_command(line)?,
    }
    Ok(true)
}

fn parse_node_id(word: Option<&str>) -> anyhow::Result<NodeId> {
    let word = word.context("missing node id")?;
    let raw = word.trim_start_matches('#').parse::<u32>().with_context(|| format!("invalid node id: {}", word))?;
    Ok(NodeId(raw))
}

fn main() -> anyhow::Result<()> {
    // Logging setup
    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter(Some("dynamic_topology_simulator"), LevelFilter::Debug)
        .parse_default_env()
        .init();

    info!("Starting up");

    let arguments = parse_arguments()?;
    let config = load_config(&arguments)?;
    let simulator = Simulator::from_config(&config)?;
    let handle = simulator.handle();
    handle.subscribe(Arc::new(LoggingObserver));

    if let Some(path) = &arguments.scene {
        let snapshot = scene::load_scene(path)?;
        let ids = handle.import(&snapshot)?;
        info!("Loaded scene {} with {} nodes", path, ids.len());
    }

    info!("Commands: add [x y], remove <id>, select <id>, save <path>, start, pause, resume, step, stop, clear, restart, quit");
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("Failed to read stdin")?;
        match handle_line(&handle, line.trim()) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => error!("{:#}", e),
        }
    }

    simulator.shutdown();
    info!("Shut down");
    Ok(())
}
