//! Scheduler thread and the thread-safe handle used to drive a topology.
//!
//! The topology lives behind one `Mutex`. A dedicated scheduler thread holds
//! that lock for the whole of each tick, so external mutations made through a
//! [`SimulationHandle`] only ever land between ticks. Notifications are
//! published after the lock is released.
//!
//! Clock states:
//!
//! ```text
//! Stopped --start--> Running --pause--> Paused --resume/start--> Running
//!    ^                  |                  |
//!    +------stop--------+-------stop-------+        dispose: terminal
//! ```

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use log::{error, info, warn};
use std::cell::Cell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use super::behavior::Behavior;
use super::command::SimulationCommand;
use super::error::TopologyError;
use super::geometry::Point;
use super::node::NodeSnapshot;
use super::notification::{Change, Notification, NotificationBus, Subject, SubscriptionId, TopologyObserver};
use super::obstacle::{Obstacle, ObstacleShape};
use super::pacing::{self, MAX_SPEED_PERCENT, MIN_SPEED_PERCENT, PacingClock};
use super::resolver::LinkResolver;
use super::snapshot::TopologySnapshot;
use super::topology::{TickReport, Topology};
use super::types::{Link, LinkOrientation, NodeId, ObstacleId};
use crate::config::SimulationConfig;

const COMMAND_QUEUE_SIZE: usize = 100;

// Maximum slice to wait so speed changes apply promptly even if a notify is missed
const MAX_WAIT_SLICE: Duration = Duration::from_millis(25);

type CommandQueue = Channel<CriticalSectionRawMutex, String, COMMAND_QUEUE_SIZE>;

thread_local! {
    // Set on the scheduler thread while it holds the topology lock.
    static IN_TICK: Cell<bool> = const { Cell::new(false) };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockState {
    Stopped,
    Running,
    Paused,
}

impl fmt::Display for ClockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClockState::Stopped => write!(f, "stopped"),
            ClockState::Running => write!(f, "running"),
            ClockState::Paused => write!(f, "paused"),
        }
    }
}

struct ClockControl {
    state: ClockState,
    disposed: bool,
    pacing: PacingClock,
    tick_period: Duration,
    /// Virtual time of the next tick while running.
    next_deadline: u64,
    step_requests: u64,
    steps_done: u64,
    commands_pending: bool,
    /// Tick counter after the last completed tick.
    tick: u64,
    fault: Option<TopologyError>,
}

struct Shared {
    topology: Mutex<Topology>,
    control: Mutex<ClockControl>,
    wakeup: Condvar,
    bus: NotificationBus,
    commands: CommandQueue,
    scheduler_thread: OnceLock<ThreadId>,
}

enum Action {
    Tick,
    /// A tick requested by `step()`; only these complete a step.
    Step,
    Commands,
    Exit,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns the scheduler thread. Dropping it disposes the simulation and joins
/// the thread.
pub struct Simulator {
    handle: SimulationHandle,
    thread: Option<JoinHandle<()>>,
}

impl Simulator {
    pub fn from_config(config: &SimulationConfig) -> Result<Self, TopologyError> {
        let topology = Topology::with_config(config)?;
        Self::new(topology, config)
    }

    /// Wraps an existing topology. The clock starts `Stopped`.
    pub fn new(topology: Topology, config: &SimulationConfig) -> Result<Self, TopologyError> {
        config.validate()?;
        let tick = topology.current_tick();
        let shared = Arc::new(Shared {
            topology: Mutex::new(topology),
            control: Mutex::new(ClockControl {
                state: ClockState::Stopped,
                disposed: false,
                pacing: PacingClock::new(config.speed_percent),
                tick_period: config.tick_period(),
                next_deadline: 0,
                step_requests: 0,
                steps_done: 0,
                commands_pending: false,
                tick,
                fault: None,
            }),
            wakeup: Condvar::new(),
            bus: NotificationBus::new(),
            commands: Channel::new(),
            scheduler_thread: OnceLock::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("topology-scheduler".into())
            .spawn(move || scheduler_thread(thread_shared))
            .map_err(|e| TopologyError::SchedulerFault(format!("failed to start scheduler thread: {}", e)))?;

        Ok(Self {
            handle: SimulationHandle { shared },
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> SimulationHandle {
        self.handle.clone()
    }

    /// Disposes the simulation and waits for the scheduler thread to exit.
    pub fn shutdown(mut self) {
        self.join();
    }

    fn join(&mut self) {
        self.handle.dispose();
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() == thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                error!("Scheduler thread panicked during shutdown");
            }
        }
    }
}

impl Drop for Simulator {
    fn drop(&mut self) {
        self.join();
    }
}

fn scheduler_thread(shared: Arc<Shared>) {
    let _ = shared.scheduler_thread.set(thread::current().id());
    info!("Scheduler thread started");
    loop {
        match next_action(&shared) {
            Action::Exit => break,
            Action::Commands => drain_commands(&shared),
            Action::Tick => {
                run_tick(&shared, false);
                drain_commands(&shared);
            }
            Action::Step => {
                run_tick(&shared, true);
                drain_commands(&shared);
            }
        }
    }
    info!("Scheduler thread stopped");
}

/// Blocks until there is something to do.
fn next_action(shared: &Shared) -> Action {
    let mut control = lock(&shared.control);
    loop {
        if control.disposed {
            return Action::Exit;
        }
        if control.commands_pending {
            control.commands_pending = false;
            return Action::Commands;
        }
        match control.state {
            ClockState::Paused if control.step_requests > control.steps_done => return Action::Step,
            ClockState::Running => {
                let due = control.pacing.map_virtual_to_real(control.next_deadline);
                let now = Instant::now();
                if due <= now {
                    // Fall back to "one period from now" when far behind instead of bursting
                    let period = pacing::period_ns(control.tick_period);
                    let now_virtual = control.pacing.map_real_to_virtual(now);
                    control.next_deadline = control.next_deadline.saturating_add(period).max(now_virtual);
                    return Action::Tick;
                }
                let wait = (due - now).min(MAX_WAIT_SLICE);
                control = shared.wakeup.wait_timeout(control, wait).unwrap_or_else(PoisonError::into_inner).0;
            }
            _ => {
                control = shared.wakeup.wait(control).unwrap_or_else(PoisonError::into_inner);
            }
        }
    }
}

fn run_tick(shared: &Shared, step: bool) {
    let outcome = {
        let mut topology = lock(&shared.topology);
        IN_TICK.with(|flag| flag.set(true));
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| topology.tick()));
        IN_TICK.with(|flag| flag.set(false));
        outcome
    };

    match outcome {
        Ok(report) => {
            {
                let mut control = lock(&shared.control);
                control.tick = report.tick;
                if step && control.steps_done < control.step_requests {
                    control.steps_done += 1;
                }
            }
            shared.wakeup.notify_all();
            publish(shared, report);
        }
        Err(payload) => {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            let fault = TopologyError::SchedulerFault(reason);
            error!("{}; clock stopped", fault);
            let tick = {
                let mut control = lock(&shared.control);
                control.state = ClockState::Stopped;
                control.fault = Some(fault);
                control.tick
            };
            shared.wakeup.notify_all();
            publish_clock_state(shared, tick);
        }
    }
}

fn drain_commands(shared: &Shared) {
    while let Ok(command) = shared.commands.try_receive() {
        shared.bus.dispatch_command(&command);
    }
}

fn publish(shared: &Shared, report: TickReport) {
    shared.bus.report_errors(&report.errors);
    shared.bus.publish(report.tick, &report.notifications);
}

fn publish_clock_state(shared: &Shared, tick: u64) {
    let notification = Notification {
        subject: Subject::Topology,
        change: Change::property("clock_state"),
    };
    shared.bus.publish(tick, &[notification]);
}

/// Cloneable, thread-safe access to a running simulation.
#[derive(Clone)]
pub struct SimulationHandle {
    shared: Arc<Shared>,
}

impl SimulationHandle {
    // ---- clock ----

    pub fn clock_state(&self) -> ClockState {
        lock(&self.shared.control).state
    }

    /// The fault that stopped the scheduler, if any.
    pub fn fault(&self) -> Option<TopologyError> {
        lock(&self.shared.control).fault.clone()
    }

    /// Stopped or Paused → Running. The first tick is due immediately.
    pub fn start(&self) -> Result<(), TopologyError> {
        self.transition("start", &[ClockState::Stopped, ClockState::Paused], ClockState::Running)
    }

    /// Running → Paused, effective at the next tick boundary.
    pub fn pause(&self) -> Result<(), TopologyError> {
        self.transition("pause", &[ClockState::Running], ClockState::Paused)
    }

    pub fn resume(&self) -> Result<(), TopologyError> {
        self.transition("resume", &[ClockState::Paused], ClockState::Running)
    }

    /// Stopping an already stopped clock is a no-op.
    pub fn stop(&self) -> Result<(), TopologyError> {
        self.transition("stop", &[ClockState::Stopped, ClockState::Running, ClockState::Paused], ClockState::Stopped)
    }

    /// Runs exactly one tick while paused and waits for it to finish.
    pub fn step(&self) -> Result<(), TopologyError> {
        self.ensure_off_scheduler("step")?;
        let mut control = lock(&self.shared.control);
        Self::check_usable(&control)?;
        if control.state != ClockState::Paused {
            return Err(TopologyError::InvalidState(format!("step() requires a paused clock, clock is {}", control.state)));
        }
        control.step_requests += 1;
        let target = control.step_requests;
        self.shared.wakeup.notify_all();

        while control.steps_done < target {
            Self::check_usable(&control)?;
            if control.state == ClockState::Stopped {
                return Err(TopologyError::InvalidState("clock stopped before the step ran".to_string()));
            }
            control = self.shared.wakeup.wait(control).unwrap_or_else(PoisonError::into_inner);
        }
        Ok(())
    }

    /// Terminal. The scheduler thread exits at the next boundary.
    pub fn dispose(&self) {
        {
            let mut control = lock(&self.shared.control);
            if control.disposed {
                return;
            }
            control.disposed = true;
            control.state = ClockState::Stopped;
            control.step_requests = control.steps_done;
        }
        self.shared.wakeup.notify_all();
        info!("Simulation disposed");
    }

    pub fn is_disposed(&self) -> bool {
        lock(&self.shared.control).disposed
    }

    pub fn speed_percent(&self) -> u32 {
        lock(&self.shared.control).pacing.speed_percent()
    }

    pub fn set_speed_percent(&self, percent: u32) -> Result<(), TopologyError> {
        if !(MIN_SPEED_PERCENT..=MAX_SPEED_PERCENT).contains(&percent) {
            return Err(TopologyError::InvalidConfiguration(format!(
                "speed must be within {}..={} percent, got {}",
                MIN_SPEED_PERCENT, MAX_SPEED_PERCENT, percent
            )));
        }
        if lock(&self.shared.control).pacing.set_speed_percent(percent) {
            info!("Simulation speed set to {}%", percent);
            self.shared.wakeup.notify_all();
        }
        Ok(())
    }

    pub fn tick_period(&self) -> Duration {
        lock(&self.shared.control).tick_period
    }

    pub fn set_tick_period(&self, period: Duration) -> Result<(), TopologyError> {
        if period.is_zero() {
            return Err(TopologyError::InvalidConfiguration("tick period must be positive".to_string()));
        }
        lock(&self.shared.control).tick_period = period;
        self.shared.wakeup.notify_all();
        Ok(())
    }

    fn transition(&self, operation: &str, from: &[ClockState], to: ClockState) -> Result<(), TopologyError> {
        self.ensure_not_in_tick(operation)?;
        let tick = {
            let mut control = lock(&self.shared.control);
            Self::check_usable(&control)?;
            if !from.contains(&control.state) {
                return Err(TopologyError::InvalidState(format!("cannot {} while {}", operation, control.state)));
            }
            if control.state == to {
                return Ok(());
            }
            if to == ClockState::Running {
                control.next_deadline = control.pacing.now_virtual();
            }
            if to == ClockState::Stopped {
                control.step_requests = control.steps_done;
            }
            info!("Clock {} -> {}", control.state, to);
            control.state = to;
            control.tick
        };
        self.shared.wakeup.notify_all();
        publish_clock_state(&self.shared, tick);
        Ok(())
    }

    fn check_usable(control: &ClockControl) -> Result<(), TopologyError> {
        if let Some(fault) = &control.fault {
            return Err(fault.clone());
        }
        if control.disposed {
            return Err(TopologyError::InvalidState("simulation has been disposed".to_string()));
        }
        Ok(())
    }

    fn ensure_not_in_tick(&self, operation: &str) -> Result<(), TopologyError> {
        if IN_TICK.with(Cell::get) {
            return Err(TopologyError::InvalidState(format!("{} called from inside a tick", operation)));
        }
        Ok(())
    }

    fn ensure_off_scheduler(&self, operation: &str) -> Result<(), TopologyError> {
        self.ensure_not_in_tick(operation)?;
        if self.shared.scheduler_thread.get() == Some(&thread::current().id()) {
            return Err(TopologyError::InvalidState(format!("{} cannot be called from the scheduler thread", operation)));
        }
        Ok(())
    }

    // ---- observers and commands ----

    pub fn subscribe(&self, observer: Arc<dyn TopologyObserver>) -> SubscriptionId {
        self.shared.bus.subscribe(observer)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.bus.unsubscribe(id)
    }

    /// Runs a built-in clock command, or queues any other text for the
    /// observers' `on_command` on the scheduler thread.
    pub fn dispatch_command(&self, command: &str) -> Result<(), TopologyError> {
        match SimulationCommand::parse(command) {
            SimulationCommand::Start => self.start(),
            SimulationCommand::Pause => self.pause(),
            SimulationCommand::Resume => self.resume(),
            SimulationCommand::Step => self.step(),
            SimulationCommand::Stop => self.stop(),
            SimulationCommand::Clear => self.with_topology(Topology::clear),
            SimulationCommand::Restart => self.with_topology(Topology::restart),
            SimulationCommand::Custom(text) => {
                if let Err(err) = self.shared.commands.try_send(text) {
                    warn!("Command queue full, dropping command");
                    return Err(TopologyError::CommandRejected(format!("command queue is full: {:?}", err)));
                }
                lock(&self.shared.control).commands_pending = true;
                self.shared.wakeup.notify_all();
                Ok(())
            }
        }
    }

    // ---- topology access ----

    /// Runs `mutate` at a tick boundary and publishes whatever it changed.
    pub fn with_topology<R>(&self, mutate: impl FnOnce(&mut Topology) -> R) -> Result<R, TopologyError> {
        self.ensure_not_in_tick("topology access")?;
        let (result, report) = {
            let mut topology = lock(&self.shared.topology);
            let result = mutate(&mut topology);
            (result, topology.drain_report())
        };
        publish(&self.shared, report);
        Ok(result)
    }

    /// Read-only access at a tick boundary.
    pub fn read<R>(&self, inspect: impl FnOnce(&Topology) -> R) -> Result<R, TopologyError> {
        self.ensure_not_in_tick("topology access")?;
        let topology = lock(&self.shared.topology);
        Ok(inspect(&topology))
    }

    pub fn current_tick(&self) -> Result<u64, TopologyError> {
        self.read(Topology::current_tick)
    }

    pub fn nodes(&self) -> Result<Vec<NodeSnapshot>, TopologyError> {
        self.read(Topology::nodes)
    }

    pub fn node(&self, id: NodeId) -> Result<Option<NodeSnapshot>, TopologyError> {
        self.read(|topology| topology.node(id))
    }

    pub fn links(&self) -> Result<Vec<Link>, TopologyError> {
        self.read(Topology::links)
    }

    pub fn add_node(&self, position: Option<Point>) -> Result<NodeId, TopologyError> {
        self.with_topology(|topology| topology.add_node(position))?
    }

    pub fn add_node_with(&self, position: Option<Point>, behavior: Box<dyn Behavior>) -> Result<NodeId, TopologyError> {
        self.with_topology(|topology| topology.add_node_with(position, behavior))?
    }

    pub fn remove_node(&self, id: NodeId) -> Result<bool, TopologyError> {
        self.with_topology(|topology| topology.remove_node(id))
    }

    pub fn select_node(&self, id: NodeId) -> Result<(), TopologyError> {
        self.with_topology(|topology| topology.select_node(id))?
    }

    pub fn add_wired_link(&self, from: NodeId, to: NodeId, orientation: LinkOrientation) -> Result<Link, TopologyError> {
        self.with_topology(|topology| topology.add_wired_link(from, to, orientation))?
    }

    pub fn remove_link(&self, link: &Link) -> Result<(), TopologyError> {
        self.with_topology(|topology| topology.remove_link(link))?
    }

    pub fn add_obstacle(&self, obstacle: Obstacle) -> Result<ObstacleId, TopologyError> {
        self.with_topology(|topology| topology.add_obstacle(obstacle))
    }

    pub fn add_obstacle_shape(&self, shape: ObstacleShape) -> Result<ObstacleId, TopologyError> {
        self.with_topology(|topology| topology.add_obstacle_shape(shape))?
    }

    pub fn remove_obstacle(&self, id: ObstacleId) -> Result<Obstacle, TopologyError> {
        self.with_topology(|topology| topology.remove_obstacle(id))?
    }

    pub fn set_link_resolver(&self, resolver: Arc<dyn LinkResolver>) -> Result<(), TopologyError> {
        self.with_topology(|topology| topology.set_link_resolver(resolver))
    }

    /// Bulk-load; refused while the clock is running.
    pub fn import(&self, snapshot: &TopologySnapshot) -> Result<Vec<NodeId>, TopologyError> {
        let state = self.clock_state();
        if state == ClockState::Running {
            return Err(TopologyError::InvalidState("import requires a stopped or paused clock".to_string()));
        }
        self.with_topology(|topology| topology.import(snapshot))?
    }

    pub fn export(&self) -> Result<TopologySnapshot, TopologyError> {
        self.read(Topology::export)
    }
}
