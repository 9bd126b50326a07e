use std::{sync::Arc, time::Duration};

use rama::{
    error::{BoxError, ErrorContext as _},
    http::Uri,
    telemetry::tracing,
};
use serde::Serialize;
use tokio::{task::JoinSet, time::Instant};

use crate::{
    config::BroadcastMethod,
    rpc::{Dialer, RpcClient, SubmitError},
    tx::{Transaction, TxSource},
};

use super::{pacer::RateGate, stats::Stats};

/// Final accounting of a single connection lane.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionReport {
    pub index: usize,
    pub endpoint: String,
    /// Distinct transactions issued (retries not included).
    pub issued: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Subset of `failed` refused by the endpoint itself.
    pub rejected: u64,
    pub reconnects: u64,
    /// Lane stopped early after two consecutive transport failures.
    pub retired: bool,
}

/// One logical link to a single RPC endpoint.
///
/// Owned exclusively by its lane task.
pub(crate) struct Connection<D> {
    endpoint: Uri,
    dialer: D,
    client: RpcClient,
    source: Arc<dyn TxSource>,
    method: BroadcastMethod,
    stats: Arc<Stats>,
    report: ConnectionReport,
}

struct Submission {
    tx: Transaction,
    attempt: u8,
    latency: Duration,
    result: Result<(), SubmitError>,
}

impl<D: Dialer> Connection<D> {
    /// Dial the endpoint, which includes its health check.
    pub(crate) async fn open(
        index: usize,
        endpoint: Uri,
        dialer: D,
        source: Arc<dyn TxSource>,
        method: BroadcastMethod,
        stats: Arc<Stats>,
    ) -> Result<Self, BoxError> {
        let client = dialer
            .dial(&endpoint)
            .await
            .context("open connection")
            .context_field("connection", index)
            .with_context_field("endpoint", || endpoint.clone())?;

        Ok(Self {
            report: ConnectionReport {
                index,
                endpoint: endpoint.to_string(),
                ..Default::default()
            },
            endpoint,
            dialer,
            client,
            source,
            method,
            stats,
        })
    }

    /// Submit transactions for every token taken from the gate,
    /// until the gate closes or the connection is retired.
    ///
    /// After a transport failure no new tokens are taken until the
    /// pipeline has drained. The failed transactions are then re-issued,
    /// lowest index first, on a fresh transport. Every transport thus sees
    /// strictly increasing indices.
    ///
    /// In-flight submissions are always drained before returning.
    pub(crate) async fn run(mut self, gate: RateGate) -> ConnectionReport {
        let max_in_flight = self.method.max_in_flight();
        let mut in_flight = JoinSet::new();
        let mut retries: Vec<Transaction> = Vec::new();
        let mut next_seq: u64 = 0;
        let mut accepting = true;

        loop {
            if !retries.is_empty() && in_flight.is_empty() {
                if self.reconnect().await {
                    retries.sort_by_key(|tx| tx.seq);
                    for tx in retries.drain(..) {
                        self.spawn_submit(&mut in_flight, tx, 1);
                    }
                } else {
                    for _ in retries.drain(..) {
                        self.stats.record_failure();
                        self.report.failed += 1;
                    }
                    self.report.retired = true;
                    accepting = false;
                }
            }

            let can_send = accepting && retries.is_empty() && in_flight.len() < max_in_flight;
            tokio::select! {
                biased;

                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    match joined {
                        Ok(submission) => {
                            if !self.settle(submission, accepting, &mut retries) {
                                accepting = false;
                            }
                        }
                        Err(err) => {
                            tracing::error!(
                                connection = self.report.index,
                                "submission task failed: {err}"
                            );
                            self.stats.record_failure();
                            self.report.failed += 1;
                        }
                    }
                }

                granted = gate.acquire(), if can_send => {
                    if !granted {
                        accepting = false;
                        continue;
                    }
                    let tx = self.source.transaction(next_seq);
                    next_seq += 1;
                    self.report.issued += 1;
                    self.stats.record_issue();
                    self.spawn_submit(&mut in_flight, tx, 0);
                }

                else => break,
            }
        }

        tracing::debug!(
            connection = self.report.index,
            endpoint = %self.endpoint,
            issued = self.report.issued,
            succeeded = self.report.succeeded,
            failed = self.report.failed,
            reconnects = self.report.reconnects,
            retired = self.report.retired,
            "connection lane finished"
        );
        self.report
    }

    fn spawn_submit(&self, in_flight: &mut JoinSet<Submission>, tx: Transaction, attempt: u8) {
        let client = self.client.clone();
        let method = self.method;
        in_flight.spawn(async move {
            let start = Instant::now();
            let result = client.broadcast_tx(method, &tx.payload).await;
            Submission {
                tx,
                attempt,
                latency: start.elapsed(),
                result,
            }
        });
    }

    /// Account for a finished submission.
    ///
    /// A first transport failure parks the transaction in `retries`.
    /// Returns `false` once the connection is retired.
    fn settle(
        &mut self,
        submission: Submission,
        may_retry: bool,
        retries: &mut Vec<Transaction>,
    ) -> bool {
        let err = match submission.result {
            Ok(()) => {
                self.stats
                    .record_success(submission.tx.payload.len(), submission.latency);
                self.report.succeeded += 1;
                return !self.report.retired;
            }
            Err(SubmitError::Rejected { code, log }) => {
                tracing::debug!(
                    connection = self.report.index,
                    seq = submission.tx.seq,
                    code,
                    "transaction rejected by endpoint: {log}"
                );
                self.stats.record_failure();
                self.report.failed += 1;
                self.report.rejected += 1;
                return !self.report.retired;
            }
            Err(SubmitError::Transport(err)) => err,
        };

        if self.report.retired || !may_retry {
            self.stats.record_failure();
            self.report.failed += 1;
            return !self.report.retired;
        }

        if submission.attempt > 0 {
            tracing::warn!(
                connection = self.report.index,
                endpoint = %self.endpoint,
                seq = submission.tx.seq,
                "retry after reconnect failed, retiring connection: {err}"
            );
            self.stats.record_failure();
            self.report.failed += 1;
            self.report.retired = true;
            return false;
        }

        tracing::debug!(
            connection = self.report.index,
            endpoint = %self.endpoint,
            seq = submission.tx.seq,
            "submission failed, retrying once the pipeline drained: {err}"
        );
        retries.push(submission.tx);
        true
    }

    async fn reconnect(&mut self) -> bool {
        match self.dialer.dial(&self.endpoint).await {
            Ok(client) => {
                self.client = client;
                self.report.reconnects += 1;
                true
            }
            Err(err) => {
                tracing::warn!(
                    connection = self.report.index,
                    endpoint = %self.endpoint,
                    "reconnect failed, retiring connection: {err}"
                );
                false
            }
        }
    }
}
