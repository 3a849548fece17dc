//! Simulated managed server fleet
//!
//! Each resource is a small process simulation: it emits console lines,
//! metrics, roster changes, background jobs, and freeze tickets while
//! running, and answers the control actions a console can send. A
//! configurable slice of the fleet emits the pre-0.9 wire shapes so the
//! console's legacy normalization paths see real traffic.

use rand::Rng;
use shared::{
    now_ms, BackgroundJob, FreezeTicket, HealthRecord, JobState, PlayerRecord, ProcessState,
    RequestAction, ResourceId, ResponseBody, WireConsoleLine, WireMetrics, WireMetricsV1,
    WirePayload,
};
use std::collections::{HashMap, VecDeque};

/// Console lines kept for the backlog request.
pub const BACKLOG_CAPACITY: usize = 200;

/// Ticks a process spends in Starting before it is Running.
const STARTUP_TICKS: u32 = 3;

const PLAYER_NAMES: [&str; 6] = ["alice", "bob", "carol", "dave", "erin", "frank"];
const JOB_KINDS: [&str; 3] = ["chunk-gc", "world-backup", "light-repair"];
const CHATTER: [&str; 5] = [
    "Saved world data",
    "Spawned wandering trader",
    "Chunk 12,-4 loaded",
    "Autosave complete",
    "Village raid started",
];

/// One simulated server process.
pub struct ServerSim {
    resource: ResourceId,
    pub process: ProcessState,
    pub eula_accepted: bool,
    /// Emits ConsoleLinesV1/MetricsV1 instead of the current shapes.
    legacy: bool,
    tick: u64,
    uptime_ticks: u64,
    startup_left: u32,
    players: Vec<PlayerRecord>,
    jobs: Vec<BackgroundJob>,
    freezes: Vec<FreezeTicket>,
    next_job_id: u64,
    next_freeze_id: u64,
    backlog: VecDeque<WireConsoleLine>,
    /// Lines produced between ticks (command echoes), flushed on the
    /// next emission.
    pending_lines: Vec<WireConsoleLine>,
}

impl ServerSim {
    pub fn new(resource: ResourceId, legacy: bool) -> Self {
        Self {
            resource,
            process: ProcessState::Stopped,
            eula_accepted: false,
            legacy,
            tick: 0,
            uptime_ticks: 0,
            startup_left: 0,
            players: Vec::new(),
            jobs: Vec::new(),
            freezes: Vec::new(),
            next_job_id: 1,
            next_freeze_id: 1,
            backlog: VecDeque::with_capacity(BACKLOG_CAPACITY),
            pending_lines: Vec::new(),
        }
    }

    pub fn resource(&self) -> &ResourceId {
        &self.resource
    }

    /// Skips the EULA/start dance so the fleet has data from the first
    /// tick.
    pub fn boot(&mut self) {
        self.eula_accepted = true;
        self.process = ProcessState::Running;
        self.push_line("info", "Server started");
    }

    fn push_line(&mut self, level: &str, text: &str) {
        let line = WireConsoleLine {
            ts_ms: now_ms(),
            level: level.to_string(),
            text: text.to_string(),
        };
        if self.backlog.len() == BACKLOG_CAPACITY {
            self.backlog.pop_front();
        }
        self.backlog.push_back(line.clone());
        self.pending_lines.push(line);
    }

    /// Advances the simulation one tick and returns the payloads to
    /// publish, one per topic that changed.
    pub fn tick(&mut self, rng: &mut impl Rng, tick_ms: u64) -> Vec<WirePayload> {
        self.tick += 1;
        let mut payloads = Vec::new();

        match self.process {
            ProcessState::Starting => {
                self.startup_left = self.startup_left.saturating_sub(1);
                if self.startup_left == 0 {
                    self.process = ProcessState::Running;
                    self.uptime_ticks = 0;
                    self.push_line("info", "Server started");
                }
            }
            ProcessState::Running => {
                self.uptime_ticks += 1;
                self.simulate_chatter(rng);
                self.simulate_players(rng);
                self.simulate_jobs(rng);
                if rng.gen_bool(0.005) {
                    self.process = ProcessState::Frozen;
                    self.push_line("error", "Main loop stopped responding");
                    self.freezes.push(FreezeTicket {
                        id: self.next_freeze_id,
                        created_ms: now_ms(),
                        blocked_ms: 0,
                        trace: "tick_world -> entity_update".to_string(),
                    });
                    self.next_freeze_id += 1;
                    payloads.push(WirePayload::Freezes(self.freezes.clone()));
                }
            }
            ProcessState::Frozen => {
                for ticket in &mut self.freezes {
                    ticket.blocked_ms += tick_ms;
                }
                payloads.push(WirePayload::Freezes(self.freezes.clone()));
                if rng.gen_bool(0.2) {
                    self.process = ProcessState::Running;
                    self.freezes.clear();
                    self.push_line("warn", "Main loop recovered");
                    payloads.push(WirePayload::Freezes(self.freezes.clone()));
                }
            }
            ProcessState::Stopped => {}
        }

        if !self.pending_lines.is_empty() {
            let lines = std::mem::take(&mut self.pending_lines);
            payloads.push(if self.legacy {
                WirePayload::ConsoleLinesV1(lines.into_iter().map(|l| (l.ts_ms, l.text)).collect())
            } else {
                WirePayload::ConsoleLines(lines)
            });
        }

        if self.process == ProcessState::Running {
            payloads.push(self.metrics_payload(rng));
            if self.tick % 5 == 0 {
                payloads.push(WirePayload::Players(self.players.clone()));
                payloads.push(WirePayload::Jobs(self.jobs.clone()));
            }
        }

        payloads.push(WirePayload::Health(self.health(tick_ms)));
        payloads
    }

    fn simulate_chatter(&mut self, rng: &mut impl Rng) {
        if rng.gen_bool(0.6) {
            let text = CHATTER[rng.gen_range(0..CHATTER.len())];
            let level = if rng.gen_bool(0.1) { "warn" } else { "info" };
            self.push_line(level, text);
        }
    }

    fn simulate_players(&mut self, rng: &mut impl Rng) {
        if self.players.len() < PLAYER_NAMES.len() && rng.gen_bool(0.1) {
            let name = PLAYER_NAMES[self.players.len()];
            self.players.push(PlayerRecord {
                name: name.to_string(),
                ping_ms: rng.gen_range(10..120),
                world: "overworld".to_string(),
                joined_ms: now_ms(),
            });
            let text = format!("{} joined the game", name);
            self.push_line("info", &text);
        } else if !self.players.is_empty() && rng.gen_bool(0.05) {
            let gone = self.players.remove(rng.gen_range(0..self.players.len()));
            let text = format!("{} left the game", gone.name);
            self.push_line("info", &text);
        }
        for player in &mut self.players {
            player.ping_ms = (player.ping_ms as i32 + rng.gen_range(-5..=5)).clamp(5, 300) as u32;
        }
    }

    fn simulate_jobs(&mut self, rng: &mut impl Rng) {
        if self.jobs.len() < 3 && rng.gen_bool(0.05) {
            self.jobs.push(BackgroundJob {
                id: self.next_job_id,
                kind: JOB_KINDS[rng.gen_range(0..JOB_KINDS.len())].to_string(),
                progress_pct: 0,
                state: JobState::Queued,
            });
            self.next_job_id += 1;
        }
        for job in &mut self.jobs {
            match job.state {
                JobState::Queued => job.state = JobState::Running,
                JobState::Running => {
                    job.progress_pct = job.progress_pct.saturating_add(rng.gen_range(5..15));
                    if job.progress_pct >= 100 {
                        job.progress_pct = 100;
                        job.state = JobState::Done;
                    }
                }
                JobState::Done | JobState::Failed => {}
            }
        }
        self.jobs
            .retain(|job| !matches!(job.state, JobState::Done | JobState::Failed));
    }

    fn metrics_payload(&self, rng: &mut impl Rng) -> WirePayload {
        let tps = 20.0 + rng.gen_range(-0.8..0.3);
        let tick_p95 = 45.0 + rng.gen_range(0.0..15.0);
        let heap = 900.0 + (self.uptime_ticks % 600) as f32;
        let gpu = rng.gen_range(1.0..3.5);
        let online = self.players.len() as u32;

        if self.legacy {
            WirePayload::MetricsV1(WireMetricsV1 {
                tps,
                tick_p95,
                heap,
                gpu_ms: gpu,
                online,
            })
        } else {
            WirePayload::Metrics(WireMetrics {
                ticks_per_second: tps,
                tick_p95_ms: tick_p95,
                heap_mb: heap,
                gpu_queue_ms: gpu,
                players_online: online,
            })
        }
    }

    fn health(&self, tick_ms: u64) -> HealthRecord {
        HealthRecord {
            state: self.process,
            uptime_s: self.uptime_ticks * tick_ms / 1000,
            last_heartbeat_ms: now_ms(),
        }
    }

    /// Answers one control action against this process.
    pub fn handle_action(&mut self, action: RequestAction) -> Result<ResponseBody, String> {
        match action {
            RequestAction::AcceptEula => {
                self.eula_accepted = true;
                Ok(ResponseBody::Ok)
            }
            RequestAction::EulaStatus => Ok(ResponseBody::Eula {
                accepted: self.eula_accepted,
            }),
            RequestAction::Start => {
                if !self.eula_accepted {
                    return Err("EULA not accepted".to_string());
                }
                if self.process != ProcessState::Stopped {
                    return Err(format!("process is {}", self.process));
                }
                self.process = ProcessState::Starting;
                self.startup_left = STARTUP_TICKS;
                self.push_line("info", "Starting server");
                Ok(ResponseBody::Ok)
            }
            RequestAction::Stop => {
                if self.process == ProcessState::Stopped {
                    return Err("process is stopped".to_string());
                }
                self.process = ProcessState::Stopped;
                self.players.clear();
                self.jobs.clear();
                self.freezes.clear();
                self.uptime_ticks = 0;
                self.push_line("info", "Stopping server");
                Ok(ResponseBody::Ok)
            }
            RequestAction::Restart => {
                if self.process == ProcessState::Stopped {
                    return Err("process is stopped".to_string());
                }
                self.players.clear();
                self.jobs.clear();
                self.freezes.clear();
                self.uptime_ticks = 0;
                self.process = ProcessState::Starting;
                self.startup_left = STARTUP_TICKS;
                self.push_line("info", "Restarting server");
                Ok(ResponseBody::Ok)
            }
            RequestAction::SendCommand { text } => {
                if self.process != ProcessState::Running {
                    return Err(format!("process is {}", self.process));
                }
                let echoed = format!("Executed: {}", text);
                self.push_line("info", &echoed);
                Ok(ResponseBody::Ok)
            }
            RequestAction::ConsoleBacklog => Ok(ResponseBody::Backlog {
                lines: self.backlog.iter().cloned().collect(),
            }),
            RequestAction::StateSnapshot => Ok(ResponseBody::State {
                players: self.players.clone(),
                metrics: if self.process == ProcessState::Running {
                    Some(WireMetrics {
                        ticks_per_second: 20.0,
                        tick_p95_ms: 50.0,
                        heap_mb: 900.0,
                        gpu_queue_ms: 2.0,
                        players_online: self.players.len() as u32,
                    })
                } else {
                    None
                },
                health: Some(self.health(0)),
            }),
        }
    }
}

/// The whole simulated fleet, keyed by resource id.
pub struct Fleet {
    servers: HashMap<ResourceId, ServerSim>,
}

impl Fleet {
    /// Builds a running fleet. Every `legacy_every`th server (1-based)
    /// emits the pre-0.9 wire shapes; 0 disables legacy emission.
    pub fn new(names: &[String], legacy_every: usize) -> Self {
        let mut servers = HashMap::new();
        for (i, name) in names.iter().enumerate() {
            let legacy = legacy_every != 0 && (i + 1) % legacy_every == 0;
            let resource = ResourceId::new(name.clone());
            let mut sim = ServerSim::new(resource.clone(), legacy);
            sim.boot();
            servers.insert(resource, sim);
        }
        Self { servers }
    }

    pub fn contains(&self, resource: &ResourceId) -> bool {
        self.servers.contains_key(resource)
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn handle_action(
        &mut self,
        resource: &ResourceId,
        action: RequestAction,
    ) -> Result<ResponseBody, String> {
        match self.servers.get_mut(resource) {
            Some(sim) => sim.handle_action(action),
            None => Err(format!("unknown resource {}", resource)),
        }
    }

    /// Ticks every server and collects the payloads to publish.
    pub fn tick(&mut self, rng: &mut impl Rng, tick_ms: u64) -> Vec<(ResourceId, WirePayload)> {
        let mut out = Vec::new();
        for (resource, sim) in self.servers.iter_mut() {
            for payload in sim.tick(rng, tick_ms) {
                out.push((resource.clone(), payload));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use shared::Topic;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn test_start_requires_eula() {
        let mut sim = ServerSim::new(ResourceId::from("srv-1"), false);

        assert_eq!(
            sim.handle_action(RequestAction::Start),
            Err("EULA not accepted".to_string())
        );

        sim.handle_action(RequestAction::AcceptEula).unwrap();
        assert_eq!(sim.handle_action(RequestAction::Start), Ok(ResponseBody::Ok));
        assert_eq!(sim.process, ProcessState::Starting);
    }

    #[test]
    fn test_eula_status_reports_acceptance() {
        let mut sim = ServerSim::new(ResourceId::from("srv-1"), false);
        assert_eq!(
            sim.handle_action(RequestAction::EulaStatus),
            Ok(ResponseBody::Eula { accepted: false })
        );
        sim.handle_action(RequestAction::AcceptEula).unwrap();
        assert_eq!(
            sim.handle_action(RequestAction::EulaStatus),
            Ok(ResponseBody::Eula { accepted: true })
        );
    }

    #[test]
    fn test_startup_completes_after_ticks() {
        let mut sim = ServerSim::new(ResourceId::from("srv-1"), false);
        sim.handle_action(RequestAction::AcceptEula).unwrap();
        sim.handle_action(RequestAction::Start).unwrap();

        let mut r = rng();
        for _ in 0..STARTUP_TICKS {
            sim.tick(&mut r, 500);
        }
        assert_eq!(sim.process, ProcessState::Running);
    }

    #[test]
    fn test_send_command_requires_running() {
        let mut sim = ServerSim::new(ResourceId::from("srv-1"), false);

        let result = sim.handle_action(RequestAction::SendCommand {
            text: "say hi".to_string(),
        });
        assert_eq!(result, Err("process is stopped".to_string()));

        sim.boot();
        let result = sim.handle_action(RequestAction::SendCommand {
            text: "say hi".to_string(),
        });
        assert_eq!(result, Ok(ResponseBody::Ok));

        // The echo shows up in the next tick's console payload
        let payloads = sim.tick(&mut rng(), 500);
        let console = payloads
            .iter()
            .find(|p| p.topic() == Topic::Console)
            .unwrap();
        match console {
            WirePayload::ConsoleLines(lines) => {
                assert!(lines.iter().any(|l| l.text == "Executed: say hi"));
            }
            other => panic!("Unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_stop_clears_roster() {
        let mut sim = ServerSim::new(ResourceId::from("srv-1"), false);
        sim.boot();
        let mut r = rng();
        for _ in 0..50 {
            sim.tick(&mut r, 500);
        }

        sim.handle_action(RequestAction::Stop).unwrap();
        assert_eq!(sim.process, ProcessState::Stopped);
        assert!(sim.players.is_empty());

        // A stopped server emits health only
        let payloads: Vec<_> = sim
            .tick(&mut r, 500)
            .into_iter()
            .filter(|p| p.topic() != Topic::Console)
            .collect();
        assert!(payloads
            .iter()
            .all(|p| p.topic() == Topic::Health));
    }

    #[test]
    fn test_running_server_emits_metrics_and_health() {
        let mut sim = ServerSim::new(ResourceId::from("srv-1"), false);
        sim.boot();

        let payloads = sim.tick(&mut rng(), 500);
        assert!(payloads.iter().any(|p| p.topic() == Topic::Metrics));
        assert!(payloads.iter().any(|p| p.topic() == Topic::Health));
    }

    #[test]
    fn test_legacy_server_emits_v1_shapes() {
        let mut sim = ServerSim::new(ResourceId::from("srv-1"), true);
        sim.boot();

        let payloads = sim.tick(&mut rng(), 500);
        for payload in payloads {
            match payload {
                WirePayload::ConsoleLines(_) | WirePayload::Metrics(_) => {
                    panic!("legacy server emitted a current wire shape")
                }
                _ => {}
            }
        }
    }

    #[test]
    fn test_backlog_is_bounded_and_returned() {
        let mut sim = ServerSim::new(ResourceId::from("srv-1"), false);
        sim.boot();
        for i in 0..(BACKLOG_CAPACITY + 50) {
            let text = format!("line {}", i);
            sim.push_line("info", &text);
        }

        match sim.handle_action(RequestAction::ConsoleBacklog).unwrap() {
            ResponseBody::Backlog { lines } => {
                assert_eq!(lines.len(), BACKLOG_CAPACITY);
                assert_eq!(lines.last().unwrap().text, format!("line {}", BACKLOG_CAPACITY + 49));
            }
            other => panic!("Unexpected response: {:?}", other),
        }
    }

    #[test]
    fn test_fleet_marks_legacy_servers() {
        let names: Vec<String> = (1..=4).map(|i| format!("srv-{}", i)).collect();
        let fleet = Fleet::new(&names, 2);

        assert!(!fleet.servers[&ResourceId::from("srv-1")].legacy);
        assert!(fleet.servers[&ResourceId::from("srv-2")].legacy);
        assert!(!fleet.servers[&ResourceId::from("srv-3")].legacy);
        assert!(fleet.servers[&ResourceId::from("srv-4")].legacy);
    }

    #[test]
    fn test_fleet_rejects_unknown_resource() {
        let mut fleet = Fleet::new(&["srv-1".to_string()], 0);
        let result = fleet.handle_action(&ResourceId::from("ghost"), RequestAction::Start);
        assert!(result.is_err());
    }

    #[test]
    fn test_state_snapshot_for_running_server() {
        let mut sim = ServerSim::new(ResourceId::from("srv-1"), false);
        sim.boot();

        match sim.handle_action(RequestAction::StateSnapshot).unwrap() {
            ResponseBody::State { metrics, health, .. } => {
                assert!(metrics.is_some());
                assert_eq!(health.unwrap().state, ProcessState::Running);
            }
            other => panic!("Unexpected response: {:?}", other),
        }
    }
}
