//! Wiring for long-running background services.

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::prelude::*;
use crate::sweep::SweepDriver;

pub fn load_drivers<D: Domain>(
    all_drivers: &FuturesUnordered<tokio::task::JoinHandle<Result<(), DriveError>>>,
    config: &RuntimeConfig,
    domain: D,
    exit: CancellationToken,
) {
    tracing::info!("starting sweep driver");

    let driver = <SweepDriver as Driver<D, CancelTokenImpl>>::run(
        config.sweeps.clone(),
        domain,
        CancelTokenImpl(exit),
    );

    let task = tokio::spawn(driver);

    all_drivers.push(task);
}

/// Run every background driver until cancellation, surfacing the first
/// driver failure.
pub async fn serve<D: Domain>(
    config: &RuntimeConfig,
    domain: D,
    exit: CancellationToken,
) -> Result<(), Error> {
    let mut drivers = FuturesUnordered::new();

    load_drivers(&drivers, config, domain, exit);

    while let Some(joined) = drivers.next().await {
        match joined {
            Ok(Ok(())) => continue,
            Ok(Err(err)) => {
                return Err(Error::invalid(format!("driver failed: {err}")));
            }
            Err(err) => {
                return Err(Error::invalid(format!("driver panicked: {err}")));
            }
        }
    }

    Ok(())
}
