use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dynamic_topology_simulator::SimulationConfig;
use dynamic_topology_simulator::simulation::{
    Behavior, ClockState, Link, LinkKind, Message, NodeContext, NodeId, Notification, Obstacle, ObstacleAwareResolver, Point,
    RangeResolver, Simulator, Subject, ToroidalResolver, Topology, TopologyObserver,
};

fn topology_with_range(range: f64) -> Topology {
    let config = SimulationConfig {
        communication_range: range,
        seed: Some(11),
        ..Default::default()
    };
    Topology::with_config(&config).unwrap()
}

/// Broadcasts once, at a chosen tick.
struct BroadcastAt {
    tick: u64,
}

impl Behavior for BroadcastAt {
    fn on_clock(&mut self, ctx: &mut NodeContext<'_>) -> anyhow::Result<()> {
        if ctx.tick() == self.tick {
            ctx.send_all(json!({ "hello": ctx.id().0 }));
        }
        Ok(())
    }
}

/// Records every message it receives with the tick it was seen in.
#[derive(Clone, Default)]
struct Inbox {
    seen: Arc<Mutex<Vec<(u64, Message)>>>,
}

impl Behavior for Inbox {
    fn on_message(&mut self, ctx: &mut NodeContext<'_>, message: &Message) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push((ctx.tick(), message.clone()));
        Ok(())
    }
}

#[test]
fn two_nodes_in_range_are_linked_after_the_first_tick() {
    let mut topology = topology_with_range(10.0);
    let a = topology.add_node(Some(Point::new(0.0, 0.0))).unwrap();
    let b = topology.add_node(Some(Point::new(5.0, 0.0))).unwrap();
    assert!(topology.links().is_empty());

    topology.tick();
    assert_eq!(topology.links(), vec![Link::undirected(a, b, LinkKind::Wireless)]);
}

#[test]
fn range_boundary_is_inclusive_both_ways() {
    let mut topology = topology_with_range(10.0);
    let a = topology.add_node(Some(Point::new(0.0, 0.0))).unwrap();
    let b = topology.add_node(Some(Point::new(10.0, 0.0))).unwrap();
    topology.tick();
    assert_eq!(topology.neighbors(a), vec![b]);

    topology.set_position(b, Point::new(10.000001, 0.0)).unwrap();
    topology.tick();
    assert!(topology.links().is_empty());
}

#[test]
fn broadcast_at_tick_five_is_visible_at_tick_six() {
    let mut topology = topology_with_range(10.0);
    topology.add_node_with(Some(Point::new(0.0, 0.0)), Box::new(BroadcastAt { tick: 5 })).unwrap();
    let inbox = Inbox::default();
    let b = topology.add_node_with(Some(Point::new(3.0, 0.0)), Box::new(inbox.clone())).unwrap();

    for _ in 0..6 {
        topology.tick();
    }
    assert!(inbox.seen.lock().unwrap().is_empty());
    // Still queued after tick 5 ran
    assert_eq!(topology.pending_message_count(), 1);

    topology.tick();
    let seen = inbox.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    let (tick, message) = &seen[0];
    assert_eq!(*tick, 6);
    assert_eq!(message.created_tick(), 5);
    assert_eq!(message.visible_tick(), 6);
    assert!(message.is_broadcast());
    assert_eq!(message.payload()["hello"], json!(0));
    assert_eq!(topology.node(b).unwrap().inbox.len(), 1);
}

#[test]
fn broadcast_without_neighbors_sends_nothing() {
    let mut topology = topology_with_range(10.0);
    topology.add_node_with(Some(Point::new(0.0, 0.0)), Box::new(BroadcastAt { tick: 1 })).unwrap();
    topology.add_node(Some(Point::new(500.0, 0.0))).unwrap();
    for _ in 0..3 {
        topology.tick();
    }
    assert_eq!(topology.message_stats().sent, 0);
    assert_eq!(topology.pending_message_count(), 0);
}

#[test]
fn messages_to_removed_nodes_are_dropped() {
    let mut topology = topology_with_range(10.0);
    topology.add_node_with(Some(Point::new(0.0, 0.0)), Box::new(BroadcastAt { tick: 1 })).unwrap();
    let b = topology.add_node(Some(Point::new(3.0, 0.0))).unwrap();
    topology.tick();
    topology.tick();
    assert_eq!(topology.pending_message_count(), 1);

    assert!(topology.remove_node(b));
    assert!(!topology.remove_node(b));
    topology.tick();
    let stats = topology.message_stats();
    assert_eq!(stats.sent, 1);
    assert_eq!(stats.delivered, 0);
    assert_eq!(stats.dropped, 1);
}

#[test]
fn toroidal_distance_connects_across_the_seam() {
    let config = SimulationConfig {
        world_width: 100.0,
        world_height: 100.0,
        communication_range: 5.0,
        ..Default::default()
    };
    let mut torus = Topology::with_config(&config).unwrap();
    torus.set_link_resolver(Arc::new(ToroidalResolver::new(100.0, 100.0).unwrap()));
    let a = torus.add_node(Some(Point::new(1.0, 50.0))).unwrap();
    let b = torus.add_node(Some(Point::new(99.0, 50.0))).unwrap();
    torus.tick();
    assert_eq!(torus.links(), vec![Link::undirected(a, b, LinkKind::Wireless)]);

    let mut plane = Topology::with_config(&config).unwrap();
    plane.set_link_resolver(Arc::new(RangeResolver::default()));
    plane.add_node(Some(Point::new(1.0, 50.0))).unwrap();
    plane.add_node(Some(Point::new(99.0, 50.0))).unwrap();
    plane.tick();
    assert!(plane.links().is_empty());
}

#[test]
fn movement_wraps_continuously_on_the_torus() {
    struct EastBound;
    impl Behavior for EastBound {
        fn on_clock(&mut self, ctx: &mut NodeContext<'_>) -> anyhow::Result<()> {
            ctx.move_forward(1.5);
            Ok(())
        }
    }

    let config = SimulationConfig {
        world_width: 10.0,
        world_height: 10.0,
        communication_range: 2.0,
        resolver: dynamic_topology_simulator::ResolverKind::Toroidal,
        ..Default::default()
    };
    let mut topology = Topology::with_config(&config).unwrap();
    let mover = topology.add_node_with(Some(Point::new(8.0, 5.0)), Box::new(EastBound)).unwrap();
    let anchor = topology.add_node(Some(Point::new(0.5, 5.0))).unwrap();

    let mut previous = topology.node(mover).unwrap().state.position;
    for _ in 0..6 {
        topology.tick();
        let position = topology.node(mover).unwrap().state.position;
        assert!((0.0..10.0).contains(&position.x));
        // Each step is 1.5 on the wrap-around metric, even across the seam
        let step = (position.x - previous.x).rem_euclid(10.0);
        assert!(step == 0.0 || (step - 1.5).abs() < 1e-9);
        previous = position;
    }
    assert!(topology.node_ids().contains(&anchor));
}

#[test]
fn obstacle_blocks_the_link_until_removed() {
    let mut topology = topology_with_range(20.0);
    topology.set_link_resolver(Arc::new(ObstacleAwareResolver::range()));
    let a = topology.add_node(Some(Point::new(0.0, 0.0))).unwrap();
    let b = topology.add_node(Some(Point::new(15.0, 0.0))).unwrap();
    topology.tick();
    assert_eq!(topology.neighbors(a), vec![b]);

    let obstacle = topology.add_obstacle(Obstacle::circle(Point::new(7.5, 0.0), 10.0).unwrap());
    topology.tick();
    assert!(topology.links().is_empty());

    topology.remove_obstacle(obstacle).unwrap();
    topology.tick();
    assert_eq!(topology.links(), vec![Link::undirected(a, b, LinkKind::Wireless)]);
}

#[test]
fn roles_are_found_by_tag() {
    struct Farmer;
    impl Behavior for Farmer {
        fn on_start(&mut self, ctx: &mut NodeContext<'_>) -> anyhow::Result<()> {
            ctx.add_tag("farmer");
            Ok(())
        }
    }

    struct Sheep {
        farmer: Arc<Mutex<Option<NodeId>>>,
    }
    impl Behavior for Sheep {
        fn on_clock(&mut self, ctx: &mut NodeContext<'_>) -> anyhow::Result<()> {
            *self.farmer.lock().unwrap() = ctx.nodes_with_tag("farmer").first().copied();
            Ok(())
        }
    }

    let mut topology = topology_with_range(10.0);
    let farmer = topology.add_node_with(Some(Point::new(0.0, 0.0)), Box::new(Farmer)).unwrap();
    let found = Arc::new(Mutex::new(None));
    topology
        .add_node_with(Some(Point::new(100.0, 0.0)), Box::new(Sheep { farmer: Arc::clone(&found) }))
        .unwrap();
    topology.tick();
    topology.tick();
    assert_eq!(*found.lock().unwrap(), Some(farmer));
}

#[derive(Default)]
struct Collector {
    batches: Mutex<Vec<(u64, Vec<Notification>)>>,
}

impl TopologyObserver for Collector {
    fn on_notifications(&self, tick: u64, notifications: &[Notification]) {
        self.batches.lock().unwrap().push((tick, notifications.to_vec()));
    }
}

#[test]
fn scheduler_thread_runs_and_publishes_batches() {
    let config = SimulationConfig {
        communication_range: 10.0,
        tick_period_ms: 1,
        speed_percent: 1000,
        ..Default::default()
    };
    let simulator = Simulator::from_config(&config).unwrap();
    let handle = simulator.handle();
    let collector = Arc::new(Collector::default());
    handle.subscribe(collector.clone());

    handle.add_node(Some(Point::new(0.0, 0.0))).unwrap();
    handle.add_node(Some(Point::new(5.0, 0.0))).unwrap();
    handle.start().unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while handle.current_tick().unwrap() < 5 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(2));
    }
    handle.pause().unwrap();
    assert!(handle.current_tick().unwrap() >= 5);
    assert_eq!(handle.links().unwrap().len(), 1);

    let paused_at = handle.current_tick().unwrap();
    handle.step().unwrap();
    assert_eq!(handle.current_tick().unwrap(), paused_at + 1);
    assert_eq!(handle.clock_state(), ClockState::Paused);

    let batches = collector.batches.lock().unwrap();
    assert!(batches.iter().any(|(_, batch)| batch.iter().any(|n| matches!(n.subject, Subject::Link(_)))));
    drop(batches);

    handle.dispatch_command("stop").unwrap();
    assert_eq!(handle.clock_state(), ClockState::Stopped);
    simulator.shutdown();
}

#[test]
fn custom_commands_reach_observers_on_the_scheduler_thread() {
    #[derive(Default)]
    struct Commands {
        received: Mutex<Vec<(String, Option<String>)>>,
    }
    impl TopologyObserver for Commands {
        fn on_notifications(&self, _tick: u64, _notifications: &[Notification]) {}

        fn on_command(&self, command: &str) {
            let thread = std::thread::current().name().map(str::to_string);
            self.received.lock().unwrap().push((command.to_string(), thread));
        }
    }

    let simulator = Simulator::from_config(&SimulationConfig::default()).unwrap();
    let handle = simulator.handle();
    let observer = Arc::new(Commands::default());
    handle.subscribe(observer.clone());
    handle.dispatch_command("highlight #2").unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while observer.received.lock().unwrap().is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(2));
    }
    let received = observer.received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].0, "highlight #2");
    assert_eq!(received[0].1.as_deref(), Some("topology-scheduler"));
}

#[test]
fn import_is_refused_while_running() {
    let config = SimulationConfig {
        tick_period_ms: 5,
        ..Default::default()
    };
    let simulator = Simulator::from_config(&config).unwrap();
    let handle = simulator.handle();
    let snapshot = dynamic_topology_simulator::scene::parse_scene(
        r#"{ "nodes": [ { "id": 1, "position": { "x": 0.0, "y": 0.0 } } ] }"#,
    )
    .unwrap();

    handle.start().unwrap();
    assert!(handle.import(&snapshot).is_err());
    handle.pause().unwrap();
    assert_eq!(handle.import(&snapshot).unwrap(), vec![NodeId(1)]);
    assert_eq!(handle.export().unwrap().nodes.len(), 1);
}

#[test]
fn step_after_pause_runs_its_own_tick() {
    struct SlowStart {
        entered: Arc<AtomicBool>,
    }
    impl Behavior for SlowStart {
        fn on_start(&mut self, _ctx: &mut NodeContext<'_>) -> anyhow::Result<()> {
            self.entered.store(true, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(200));
            Ok(())
        }
    }

    let config = SimulationConfig {
        tick_period_ms: 1,
        ..Default::default()
    };
    let simulator = Simulator::from_config(&config).unwrap();
    let handle = simulator.handle();
    let entered = Arc::new(AtomicBool::new(false));
    handle
        .add_node_with(Some(Point::new(0.0, 0.0)), Box::new(SlowStart { entered: Arc::clone(&entered) }))
        .unwrap();

    handle.start().unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while !entered.load(Ordering::SeqCst) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }
    // Tick 0 is still inside on_start here
    handle.pause().unwrap();
    handle.step().unwrap();
    assert_eq!(handle.current_tick().unwrap(), 2);
    assert_eq!(handle.clock_state(), ClockState::Paused);
}

#[test]
fn external_mutations_land_between_ticks() {
    struct CountWatcher {
        counts: Arc<Mutex<Vec<(u64, usize, usize)>>>,
    }
    impl Behavior for CountWatcher {
        fn on_clock(&mut self, ctx: &mut NodeContext<'_>) -> anyhow::Result<()> {
            let before = ctx.node_count();
            std::thread::sleep(Duration::from_millis(20));
            let after = ctx.node_count();
            self.counts.lock().unwrap().push((ctx.tick(), before, after));
            Ok(())
        }
    }

    let config = SimulationConfig {
        tick_period_ms: 1,
        speed_percent: 1000,
        ..Default::default()
    };
    let simulator = Simulator::from_config(&config).unwrap();
    let handle = simulator.handle();
    let counts = Arc::new(Mutex::new(Vec::new()));
    handle
        .add_node_with(Some(Point::new(0.0, 0.0)), Box::new(CountWatcher { counts: Arc::clone(&counts) }))
        .unwrap();
    handle.start().unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while counts.lock().unwrap().is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }
    // Lands in the middle of some on_clock sleep; must wait for the boundary
    std::thread::sleep(Duration::from_millis(5));
    let (added, first_tick_with_node) = handle
        .with_topology(|topology| (topology.add_node(Some(Point::new(500.0, 500.0))), topology.current_tick()))
        .unwrap();
    added.unwrap();

    while handle.current_tick().unwrap() < first_tick_with_node + 3 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(2));
    }
    handle.pause().unwrap();

    let counts = counts.lock().unwrap();
    assert!(counts.iter().all(|(_, before, after)| before == after));
    for (tick, before, _) in counts.iter() {
        let expected = if *tick < first_tick_with_node { 1 } else { 2 };
        assert_eq!(*before, expected, "tick {}", tick);
    }
    assert!(counts.iter().any(|(tick, _, _)| *tick == first_tick_with_node));
}
