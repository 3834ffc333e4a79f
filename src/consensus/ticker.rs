use crate::consensus::messages::TimeoutInfo;
use crossbeam_channel::{after, bounded, never, select, Receiver, Sender};
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::debug;

enum TickerCommand {
    Schedule(TimeoutInfo),
    Stop,
}

/// Schedules a single pending timeout. Each `schedule` call replaces any
/// previously armed, unfired timeout; at most one is armed at any
/// moment. The fired value carries the (height, round, step) it was
/// armed for so the receiver can discard obsolete ticks.
pub struct TimeoutTicker {
    cmd_tx: Sender<TickerCommand>,
    tock_rx: Receiver<TimeoutInfo>,
    handle: Option<JoinHandle<()>>,
}

impl TimeoutTicker {
    pub fn new() -> Self {
        let (cmd_tx, cmd_rx) = bounded::<TickerCommand>(16);
        let (tock_tx, tock_rx) = bounded::<TimeoutInfo>(16);
        let handle = std::thread::Builder::new()
            .name("timeout-ticker".into())
            .spawn(move || ticker_loop(cmd_rx, tock_tx))
            .expect("spawn ticker thread");
        TimeoutTicker {
            cmd_tx,
            tock_rx,
            handle: Some(handle),
        }
    }

    /// Arms `ti`, dropping whatever was armed before.
    pub fn schedule(&self, ti: TimeoutInfo) {
        let _ = self.cmd_tx.send(TickerCommand::Schedule(ti));
    }

    /// Fired timeouts arrive here.
    pub fn tock_channel(&self) -> &Receiver<TimeoutInfo> {
        &self.tock_rx
    }

    /// Idempotent.
    pub fn stop(&mut self) {
        let _ = self.cmd_tx.send(TickerCommand::Stop);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Default for TimeoutTicker {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimeoutTicker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn ticker_loop(cmd_rx: Receiver<TickerCommand>, tock_tx: Sender<TimeoutInfo>) {
    let mut armed: Option<(Receiver<Instant>, TimeoutInfo)> = None;
    loop {
        let timer = armed.as_ref().map(|(t, _)| t.clone()).unwrap_or_else(never);
        select! {
            recv(cmd_rx) -> cmd => match cmd {
                Ok(TickerCommand::Schedule(ti)) => {
                    debug!(timeout = %ti, "scheduling timeout");
                    armed = Some((after(ti.duration), ti));
                }
                Ok(TickerCommand::Stop) | Err(_) => return,
            },
            recv(timer) -> _ => {
                if let Some((_, ti)) = armed.take() {
                    debug!(timeout = %ti, "timeout fired");
                    if tock_tx.send(ti).is_err() {
                        return;
                    }
                }
            }
        }
    }
}
