//! Run Lifecycle
//!
//! One instance of the swarm runs [`run_instance`]: it resolves its role,
//! then walks every permutation of the test matrix in lock-step with the
//! other instances. Every phase ends at a named barrier that all instances
//! signal, so no instance enters phase N+1 before the whole swarm left N:
//!
//! ```text
//! start-file-<p> -> ingest -> injest-complete-<p> -> [tcp-fetch-<p>]
//!   for each run r: start-run-<p>-<r> -> dial -> connect-complete-<p>-<r>
//!     -> leech waves -> transfer-complete-<p>-<r> -> metrics -> cleanup
//! ```
//!
//! Leeches alone synchronize on the per-wave barriers, targeting the leech
//! count of their role assignment.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout_at, Instant};

use crate::tb_backend::NodeBuilder;
use crate::tb_dialer::{rate_limit, Dialer};
use crate::tb_error::{ConfigError, CoordinationError, TestbedError};
use crate::tb_fraction::apply_seed_fraction;
use crate::tb_identity::HostKey;
use crate::tb_interface::{AddrInfo, ContentId, MetricsRecorder, Node, NodeType, PeerInfo};
use crate::tb_metrics::{LogMessageRecorder, MetricsSink, RunIdentifier, RunMetricsRecorder};
use crate::tb_network::{setup_network, NetworkShaper};
use crate::tb_params::{TestPermutation, TestVars};
use crate::tb_roles::{resolve_role, resolve_seed_index, RoleAssignment};
use crate::tb_swarm::MemorySwarm;
use crate::tb_sync::{signal_and_wait_for_all, InstanceOutcome, SyncClient, Topic};
use crate::tb_sync_memory::MemorySyncService;
use crate::tb_tcp::{fetch_file_tcp, TcpFileServer};

/// What the runtime tells an instance about its place in the swarm
#[derive(Debug, Clone)]
pub struct InstanceEnv {
    /// Launch index, used to label the recorded outcome
    pub instance_id: u64,
    pub instance_count: usize,
    pub group_id: Option<String>,
    /// Instances sharing `group_id`, the whole swarm when ungrouped
    pub group_instance_count: usize,
    /// Address the TCP baseline server binds to
    pub data_ip: String,
}

impl InstanceEnv {
    pub fn new(instance_id: u64, instance_count: usize) -> Self {
        Self {
            instance_id,
            instance_count,
            group_id: None,
            group_instance_count: instance_count,
            data_ip: "127.0.0.1".to_string(),
        }
    }

    pub fn with_group(mut self, group_id: impl Into<String>, group_instance_count: usize) -> Self {
        self.group_id = Some(group_id.into());
        self.group_instance_count = group_instance_count;
        self
    }
}

/// Everything one instance needs to take part in a test
pub struct Instance {
    pub env: InstanceEnv,
    pub client: Arc<dyn SyncClient>,
    pub node: Arc<dyn Node>,
    pub shaper: Arc<dyn NetworkShaper>,
    pub sink: Arc<dyn MetricsSink>,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub permutation: usize,
    pub run: usize,
    /// Roots seen by this instance: published by a seed, awaited by a leech
    pub root: Option<ContentId>,
    pub dialed: usize,
    pub wave: Option<usize>,
    pub fetch_started: Option<Instant>,
    pub time_to_fetch: Option<Duration>,
    /// Failures so far in this permutation
    pub leech_fails: u64,
    pub tcp_fetch: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct InstanceReport {
    pub seq: u64,
    pub node_type: NodeType,
    pub tp_index: usize,
    pub seed_index: Option<u64>,
    pub runs: Vec<RunReport>,
}

// ============================================================================
// Initialization
// ============================================================================

/// Role and roster of one instance, resolved once per test
#[derive(Debug, Clone)]
pub struct TestData {
    pub addr: AddrInfo,
    pub role: RoleAssignment,
    pub seed_index: Option<u64>,
    pub peer_infos: Vec<PeerInfo>,
    pub dialer: Dialer,
}

impl TestData {
    /// Register with the swarm and learn everyone else.
    ///
    /// Configuration is validated before the first publish so a bad
    /// configuration fails this instance without holding up a barrier.
    pub async fn initialize(
        client: &dyn SyncClient,
        env: &InstanceEnv,
        vars: &TestVars,
        addr: AddrInfo,
        deadline: Instant,
    ) -> Result<Self, TestbedError> {
        vars.counts.validate(env.instance_count)?;
        let group = match env.group_id.as_deref() {
            Some(g) => vars.group_counts(g).map(|counts| (g, counts)),
            None => None,
        };
        match group {
            Some((_, counts)) => counts.validate(env.group_instance_count)?,
            None => vars.counts.validate_has_seed(env.instance_count)?,
        }
        vars.backend.validate_topology(env.instance_count, vars.counts)?;

        let seq = timeout_at(deadline, Topic::<AddrInfo>::new("peers").publish(client, &addr))
            .await
            .map_err(|_| CoordinationError::Timeout("peers".to_string()))??;

        let role = resolve_role(client, &addr, seq, vars.counts, group).await?;

        Topic::<PeerInfo>::new("peerInfos")
            .publish(
                client,
                &PeerInfo {
                    addr: addr.clone(),
                    node_type: role.node_type,
                },
            )
            .await?;

        let seed_index = resolve_seed_index(client, &addr, &role, deadline).await?;

        let peer_infos = Topic::<PeerInfo>::new("peerInfos")
            .collect(client, env.instance_count, deadline)
            .await?;
        log::debug!("{} {}: got all {} peer infos", role.node_type, role.tp_index, peer_infos.len());

        Ok(Self {
            addr,
            role,
            seed_index,
            peer_infos,
            dialer: vars.dialer,
        })
    }
}

// ============================================================================
// Transfer
// ============================================================================

struct Transfer<'a> {
    inst: &'a Instance,
    vars: &'a TestVars,
    data: TestData,
    deadline: Instant,
    tag: String,
}

impl Transfer<'_> {
    fn client(&self) -> &dyn SyncClient {
        self.inst.client.as_ref()
    }

    fn node_type(&self) -> NodeType {
        self.data.role.node_type
    }

    async fn barrier(&self, state: &str, deadline: Instant) -> Result<u64, CoordinationError> {
        let target = self.inst.env.instance_count as u64;
        signal_and_wait_for_all(self.client(), state, target, deadline).await
    }

    async fn run(&self) -> Result<Vec<RunReport>, TestbedError> {
        let mut reports = Vec::new();

        for (p, perm) in self.vars.permutations.iter().enumerate() {
            setup_network(
                self.inst.shaper.as_ref(),
                &self.vars.latency_overrides,
                self.node_type(),
                self.data.role.tp_index,
                perm.latency,
                perm.bandwidth_mb,
                perm.jitter_pct,
            )
            .await
            .map_err(TestbedError::Network)?;

            self.barrier(&format!("start-file-{}", p), self.deadline).await?;

            let root = match self.node_type() {
                NodeType::Seed => self.add_publish_file(p, perm).await?,
                NodeType::Leech => Some(
                    Topic::<ContentId>::new(format!("root-cid-{}", p))
                        .wait_first(self.client(), self.deadline)
                        .await?,
                ),
                NodeType::Passive => None,
            };
            log::info!("{}: file ingest complete for permutation {}", self.tag, p);

            self.barrier(&format!("injest-complete-{}", p), self.deadline).await?;

            let tcp_fetch = if self.vars.tcp_enabled {
                self.tcp_phase(p, perm).await?
            } else {
                None
            };

            let mut leech_fails = 0;
            for run in 1..=self.vars.run_count {
                let report = self.run_once(p, perm, run, root, tcp_fetch, &mut leech_fails).await?;
                reports.push(report);
            }

            if self.node_type() == NodeType::Seed {
                self.inst
                    .node
                    .clear_datastore(root.as_ref())
                    .await
                    .map_err(TestbedError::Cleanup)?;
            }
        }

        log::info!("{}: ending testcase", self.tag);
        Ok(reports)
    }

    /// Ingest the permutation's file if this seed is inside the seeder rate
    async fn add_publish_file(&self, p: usize, perm: &TestPermutation) -> Result<Option<ContentId>, TestbedError> {
        let seeders = self.vars.counts.seeds(self.inst.env.instance_count);
        let to_seed = rate_limit(seeders, self.vars.seeder_rate);
        if self.data.role.tp_index >= to_seed {
            log::info!("{}: outside seeder rate ({} of {} seed)", self.tag, to_seed, seeders);
            return Ok(None);
        }

        log::info!("{}: generating {} byte file", self.tag, perm.file.size());
        let file = perm.file.generate().map_err(|e| TestbedError::Add(e.into()))?;

        let start = Instant::now();
        let root = self.inst.node.add(&file).await.map_err(TestbedError::Add)?;
        log::info!("{}: added {} in {} ms", self.tag, root, start.elapsed().as_millis());

        if let (Some(fraction), Some(dag)) = (self.vars.seed_fraction, self.inst.node.dag_service()) {
            let seed_index = self.data.seed_index.unwrap_or(0);
            let outcome = apply_seed_fraction(dag, &root, fraction, seed_index)
                .await
                .map_err(TestbedError::Add)?;
            log::info!(
                "{}: kept {} of {} leaves for fraction {}/{}",
                self.tag,
                outcome.leaves - outcome.removed,
                outcome.leaves,
                fraction.numerator,
                fraction.denominator
            );
        }

        Topic::<ContentId>::new(format!("root-cid-{}", p))
            .publish(self.client(), &root)
            .await?;
        Ok(Some(root))
    }

    /// Plain TCP transfer of the same file, as a baseline
    async fn tcp_phase(&self, p: usize, perm: &TestPermutation) -> Result<Option<Duration>, TestbedError> {
        let addr_topic = Topic::<String>::new(format!("tcp-addr-{}", p));
        let done = format!("tcp-fetch-{}", p);

        match self.node_type() {
            NodeType::Seed => {
                let file = perm.file.generate().map_err(|e| TestbedError::Tcp(e.into()))?;
                let server = TcpFileServer::spawn(&self.inst.env.data_ip, Arc::new(file))
                    .await
                    .map_err(|e| TestbedError::Tcp(e.into()))?;
                addr_topic.publish(self.client(), &server.addr().to_string()).await?;

                let waited = self.barrier(&done, self.deadline).await;
                server.close().await;
                waited?;
                Ok(None)
            }
            NodeType::Leech => {
                let addr = addr_topic.wait_first(self.client(), self.deadline).await?;
                let start = Instant::now();
                let received = timeout_at(self.deadline, fetch_file_tcp(&addr))
                    .await
                    .map_err(|_| TestbedError::Timeout)?
                    .map_err(TestbedError::Tcp)?;
                let elapsed = start.elapsed();
                log::info!("{}: fetched {} bytes over TCP in {:?}", self.tag, received, elapsed);

                self.barrier(&done, self.deadline).await?;
                Ok(Some(elapsed))
            }
            NodeType::Passive => {
                self.barrier(&done, self.deadline).await?;
                Ok(None)
            }
        }
    }

    async fn run_once(
        &self,
        p: usize,
        perm: &TestPermutation,
        run: usize,
        root: Option<ContentId>,
        tcp_fetch: Option<Duration>,
        leech_fails: &mut u64,
    ) -> Result<RunReport, TestbedError> {
        let run_id = format!("{}-{}", p, run);
        let run_deadline = self.deadline.min(Instant::now() + self.vars.run_timeout);
        log::info!("{}: starting run {} / {}", self.tag, run, self.vars.run_count);

        self.barrier(&format!("start-run-{}", run_id), run_deadline).await?;

        let node = self.inst.node.as_ref();
        let host = node.host();
        let dialed = timeout_at(
            run_deadline,
            self.data.dialer.dial(
                host.as_ref(),
                self.node_type(),
                &self.data.peer_infos,
                self.vars.max_connection_rate,
            ),
        )
        .await
        .map_err(|_| TestbedError::Timeout)?
        .map_err(TestbedError::Dial)?;
        log::info!("{}: dialed {} other nodes", self.tag, dialed.len());

        self.barrier(&format!("connect-complete-{}", run_id), run_deadline).await?;

        let mut report = RunReport {
            permutation: p,
            run,
            root,
            dialed: dialed.len(),
            wave: None,
            fetch_started: None,
            time_to_fetch: None,
            leech_fails: 0,
            tcp_fetch,
        };

        if self.node_type() == NodeType::Leech {
            if let Some(root) = root {
                self.leech_waves(&run_id, &root, run_deadline, &mut report, leech_fails).await?;
            }
        }
        report.leech_fails = *leech_fails;

        self.barrier(&format!("transfer-complete-{}", run_id), run_deadline).await?;

        let id = self.run_identifier(perm, run);
        let recorder = RunMetricsRecorder::new(&id, self.inst.sink.clone());
        if self.node_type() == NodeType::Leech {
            let nanos = report.time_to_fetch.map(|d| d.as_nanos() as f64).unwrap_or(0.0);
            recorder.record("time_to_fetch", nanos);
            recorder.record("leech_fails", *leech_fails as f64);
            recorder.record("tcp_fetch", tcp_fetch.map(|d| d.as_nanos() as f64).unwrap_or(0.0));
        }
        node.emit_metrics(&recorder).map_err(TestbedError::Metrics)?;

        host.close_connections().await.map_err(TestbedError::Cleanup)?;
        if self.node_type() != NodeType::Seed {
            node.clear_datastore(root.as_ref()).await.map_err(TestbedError::Cleanup)?;
        }

        Ok(report)
    }

    async fn leech_waves(
        &self,
        run_id: &str,
        root: &ContentId,
        run_deadline: Instant,
        report: &mut RunReport,
        leech_fails: &mut u64,
    ) -> Result<(), TestbedError> {
        let waves = self.vars.num_waves;
        let leeches = self.data.role.counts.leech as u64;
        let group = self.data.role.group.as_deref().unwrap_or("");

        for wave in 0..waves {
            if self.data.role.tp_index % waves == wave {
                report.wave = Some(wave);
                log::info!("{}: starting wave {}", self.tag, wave);

                let starts = u32::try_from(self.data.role.seq.saturating_sub(1)).unwrap_or(u32::MAX);
                let stagger = self.vars.request_stagger.checked_mul(starts);
                if stagger != Some(Duration::ZERO) {
                    // an overflowing stagger only delays the start up to the run deadline
                    let wake = stagger
                        .and_then(|d| Instant::now().checked_add(d))
                        .map_or(run_deadline, |t| t.min(run_deadline));
                    sleep_until(wake).await;
                }

                let start = Instant::now();
                report.fetch_started = Some(start);
                let fetch_deadline = run_deadline.min(start + self.vars.run_timeout / 2);
                match timeout_at(fetch_deadline, self.inst.node.fetch(root, &self.data.peer_infos)).await {
                    Ok(Ok(file)) => {
                        let elapsed = start.elapsed();
                        log::info!("{}: leech fetch of {} bytes complete ({:?})", self.tag, file.size(), elapsed);
                        if let Some(dir) = &self.vars.scratch_dir {
                            self.write_scratch(dir, run_id, &file.data).await?;
                        }
                        report.time_to_fetch = Some(elapsed);
                    }
                    Ok(Err(e)) => {
                        log::warn!("{}: error fetching data: {}", self.tag, e);
                        *leech_fails += 1;
                    }
                    Err(_) => {
                        log::warn!("{}: fetch timed out", self.tag);
                        *leech_fails += 1;
                    }
                }
            }

            if wave + 1 < waves {
                sleep(self.vars.wave_settle).await;
            }

            let state = format!("leech-wave-{}{}-{}", group, run_id, wave);
            signal_and_wait_for_all(self.client(), &state, leeches, run_deadline).await?;
        }
        Ok(())
    }

    async fn write_scratch(&self, dir: &Path, run_id: &str, data: &[u8]) -> Result<(), TestbedError> {
        let path = dir.join(format!("leech-{}-{}.bin", self.data.role.tp_index, run_id));
        tokio::fs::write(&path, data).await.map_err(TestbedError::Scratch)
    }

    fn run_identifier(&self, perm: &TestPermutation, run: usize) -> RunIdentifier {
        let role = &self.data.role;
        RunIdentifier {
            seeds: self.vars.counts.seeds(self.inst.env.instance_count),
            leech: self.vars.counts.leech,
            passive: self.vars.counts.passive,
            max_connection_rate: self.vars.max_connection_rate,
            latency_ms: perm.latency.as_millis(),
            bandwidth_mb: perm.bandwidth_mb,
            run,
            seq: role.seq,
            group_name: self.inst.env.group_id.clone().unwrap_or_default(),
            grpseq: role.grpseq,
            file_size: perm.file.size(),
            node_type: role.node_type,
            tp_index: role.tp_index,
        }
    }
}

fn spawn_keep_alive(node: Arc<dyn Node>, every: Duration, tag: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        let recorder = LogMessageRecorder::new(tag);
        let mut interval = tokio::time::interval(every.max(Duration::from_millis(1)));
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(e) = node.emit_keep_alive(&recorder) {
                log::warn!("keep-alive failed: {}", e);
            }
        }
    })
}

/// Run the whole test for one instance
pub async fn run_transfer(inst: &Instance, vars: &TestVars) -> Result<InstanceReport, TestbedError> {
    let deadline = Instant::now() + vars.timeout;
    let addr = inst.node.host().addr_info();
    let data = TestData::initialize(inst.client.as_ref(), &inst.env, vars, addr, deadline).await?;

    let tag = format!("{} {}", data.role.node_type, data.role.tp_index);
    let keep_alive = vars
        .long_lasting
        .then(|| spawn_keep_alive(inst.node.clone(), vars.keepalive, tag.clone()));

    let transfer = Transfer {
        inst,
        vars,
        data,
        deadline,
        tag,
    };
    let runs = transfer.run().await;

    if let Some(handle) = keep_alive {
        handle.abort();
    }

    let role = &transfer.data.role;
    Ok(InstanceReport {
        seq: role.seq,
        node_type: role.node_type,
        tp_index: role.tp_index,
        seed_index: transfer.data.seed_index,
        runs: runs?,
    })
}

/// [`run_transfer`], then record the outcome with the sync service
pub async fn run_instance(inst: Instance, vars: &TestVars) -> Result<InstanceReport, TestbedError> {
    let result = run_transfer(&inst, vars).await;

    let outcome = match &result {
        Ok(_) => InstanceOutcome::Success,
        Err(e) => {
            log::error!("instance {} failed: {}", inst.env.instance_id, e);
            InstanceOutcome::Failure(e.to_string())
        }
    };
    if let Err(e) = inst.client.record_outcome(inst.env.instance_id, outcome).await {
        log::warn!("could not record outcome of instance {}: {}", inst.env.instance_id, e);
    }

    result
}

// ============================================================================
// In-process Swarm
// ============================================================================

/// A whole test run in one process
pub struct LocalRun {
    pub reports: Vec<Result<InstanceReport, TestbedError>>,
    pub sync: MemorySyncService,
    pub swarm: MemorySwarm,
}

/// Build one node per environment on a shared in-memory swarm and run all
/// instances concurrently. Host keys derive from `seed` and the launch index.
pub async fn run_local(
    vars: Arc<TestVars>,
    envs: Vec<InstanceEnv>,
    sink: Arc<dyn MetricsSink>,
    seed: u64,
) -> Result<LocalRun, ConfigError> {
    let sync = MemorySyncService::new();
    let swarm = MemorySwarm::new(seed);
    let builder = NodeBuilder::from_vars(&vars);

    let mut instances = Vec::with_capacity(envs.len());
    for env in envs {
        let key = HostKey::from_seed(seed.wrapping_add(env.instance_id));
        let node = builder.build(&swarm, &key, env.instance_count, vars.counts)?;
        let node: Arc<dyn Node> = Arc::new(node);
        let shaper = Arc::new(swarm.shaper(key.host_id()));
        instances.push(Instance {
            env,
            client: Arc::new(sync.clone()),
            node,
            shaper,
            sink: sink.clone(),
        });
    }

    let handles: Vec<_> = instances
        .into_iter()
        .map(|inst| {
            let vars = vars.clone();
            tokio::spawn(async move { run_instance(inst, &vars).await })
        })
        .collect();

    let mut reports = Vec::with_capacity(handles.len());
    for handle in handles {
        reports.push(handle.await.unwrap_or_else(|e| Err(TestbedError::Aborted(e.to_string()))));
    }

    Ok(LocalRun { reports, sync, swarm })
}
