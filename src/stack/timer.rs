//! Timeout scheduler
//!
//! A tokio task that enters the engine every `timer_interval` to run its
//! timer processing, exactly like any other caller: through the Stack Lock.
//! It also runs the datagram idle sweep. The task holds only a `Weak`
//! reference to the stack and exits when the stack is dropped or shut down.

use std::sync::Weak;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error};

use super::StackInner;

/// Scheduler timing
#[derive(Debug, Clone, Copy)]
pub(crate) struct SchedulerConfig {
    pub tick: Duration,
    pub sweep_interval: Duration,
    pub idle_timeout: Duration,
}

pub(crate) struct TimeoutScheduler;

impl TimeoutScheduler {
    /// Spawn the scheduler task on `runtime`
    pub(crate) fn spawn(
        runtime: &Handle,
        stack: Weak<StackInner>,
        config: SchedulerConfig,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        runtime.spawn(async move {
            let mut ticker = tokio::time::interval(config.tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last_sweep = Instant::now();

            debug!("Timeout scheduler started ({:?} tick)", config.tick);

            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!("Timeout scheduler stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        let Some(stack) = stack.upgrade() else {
                            break;
                        };

                        if let Err(e) = stack.tick() {
                            if e.is_fatal() {
                                error!("Fatal engine fault during timer processing: {}", e);
                                stack.fail(e.to_string());
                                break;
                            }
                            debug!("Timer processing error ignored: {}", e);
                        }

                        if last_sweep.elapsed() >= config.sweep_interval {
                            last_sweep = Instant::now();
                            stack.expire_idle_flows(config.idle_timeout);
                        }
                    }
                }
            }
        })
    }
}
