//! Wires the client, the channel and the executor host together, either
//! in one process or with the host serving envelopes over stdio.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use coderun_channel::{in_process_pair, line_endpoint};
use coderun_client::{DispatchedRequest, RunnerClient, RunnerClientConfig};
use coderun_config::{CoderunConfig, FramingToml, LanguagesConfigToml};
use coderun_executor::{
    ExecutorHost, ExecutorSet, PayloadFraming, ProcessExecutorConfig, ProcessExecutorFactory,
    ProcessPool, ProcessPoolConfig, ProcessPoolStats,
};
use coderun_protocol::{Language, LocalKeyAllocator};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;

pub fn executor_set_from_config(languages: &LanguagesConfigToml) -> ExecutorSet {
    let mut executors = ExecutorSet::new();
    for (language, settings) in languages.enabled() {
        let mut config = ProcessExecutorConfig::new(language, &settings.program)
            .with_args(settings.args.iter().cloned())
            .with_framing(payload_framing(settings.framing));
        config.environment = settings
            .environment
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        config.working_dir = settings.working_dir.as_ref().map(PathBuf::from);
        executors.insert(Arc::new(ProcessExecutorFactory::new(config)));
    }
    executors
}

pub fn payload_framing(framing: FramingToml) -> PayloadFraming {
    match framing {
        FramingToml::JsonLine => PayloadFraming::JsonLine,
        FramingToml::RawLine => PayloadFraming::RawLine,
        FramingToml::RawThenClose => PayloadFraming::RawThenClose,
    }
}

pub fn pool_config(config: &CoderunConfig) -> ProcessPoolConfig {
    ProcessPoolConfig {
        buffer_size: config.pool.buffer_size,
        refill_attempts: config.pool.refill_attempts,
    }
}

pub fn client_config(config: &CoderunConfig) -> RunnerClientConfig {
    RunnerClientConfig {
        halt_timeout: (config.client.halt_timeout_secs > 0)
            .then(|| Duration::from_secs(config.client.halt_timeout_secs)),
        watchdog_interval: Duration::from_millis(config.client.watchdog_interval_ms),
    }
}

/// Client and executor host sharing one process over the in-process channel.
pub struct InProcessRunner {
    client: RunnerClient,
    host: ExecutorHost,
    host_task: JoinHandle<()>,
}

impl InProcessRunner {
    pub fn client(&self) -> &RunnerClient {
        &self.client
    }

    pub fn run_code(&self, language: Language, code: impl Into<String>) -> DispatchedRequest {
        self.client.run_code(language, code)
    }

    pub fn pool_stats(&self) -> ProcessPoolStats {
        self.host.pool().stats()
    }

    pub fn live_processes(&self) -> usize {
        self.host.live_requests()
    }

    /// Kills every running and idle executor.
    pub fn shutdown(self) {
        self.host.shutdown();
        self.host_task.abort();
    }
}

/// Must be called from within a tokio runtime; the pool warms up before
/// this returns.
pub fn start_in_process(
    executors: ExecutorSet,
    pool_config: ProcessPoolConfig,
    client_config: RunnerClientConfig,
) -> InProcessRunner {
    let (client_end, host_end) = in_process_pair();
    let (host_outbound, host_inbound) = host_end.into_parts();
    let host = ExecutorHost::new(host_outbound, ProcessPool::new(executors, pool_config));
    let host_task = host.clone().spawn(host_inbound);
    let client = RunnerClient::start(
        client_end,
        Arc::new(LocalKeyAllocator::new()),
        client_config,
    );
    InProcessRunner {
        client,
        host,
        host_task,
    }
}

/// Runs an executor host over newline-delimited JSON envelopes until the
/// reader reaches EOF.
pub async fn serve<R, W>(
    reader: R,
    writer: W,
    executors: ExecutorSet,
    pool_config: ProcessPoolConfig,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbound, inbound) = line_endpoint(reader, writer).into_parts();
    let pool = ProcessPool::new(executors, pool_config);
    tracing::info!(languages = ?pool.stats().idle_slots, "executor host serving");
    ExecutorHost::new(outbound, pool).run(inbound).await;
}

pub async fn serve_stdio(config: &CoderunConfig) {
    serve(
        tokio::io::stdin(),
        tokio::io::stdout(),
        executor_set_from_config(&config.languages),
        pool_config(config),
    )
    .await;
}
