use tlscanary_engine::StopHandle;

/// Ctrl-C handling: the first signal requests a graceful stop so modes
/// can commit partial progress; the second escalates to a hard stop.
/// The exit decision stays with the main loop, which observes the hard
/// stop, tears the worker fleet down and only then returns the
/// user-interrupt exit code.
pub fn spawn_ctrl_c_handler(stop: StopHandle) {
    tokio::spawn(async move {
        let mut signals: u8 = 0;
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            signals += 1;
            if signals == 1 {
                tracing::warn!(
                    "user interrupt, committing partial progress (press Ctrl-C again to exit immediately)"
                );
                stop.request_stop();
            } else {
                tracing::error!("user interrupt, tearing down workers and exiting");
                stop.request_hard_stop();
                return;
            }
        }
    });
}
