use crate::utils::error::{Error, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

static PROM_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the global Prometheus recorder. Later calls are no-ops.
pub fn init() -> Result<()> {
    if PROM_HANDLE.get().is_some() {
        return Ok(());
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| Error::Other(format!("prometheus recorder: {e}")))?;
    let _ = PROM_HANDLE.set(handle);
    Ok(())
}

pub fn handle() -> Option<&'static PrometheusHandle> {
    PROM_HANDLE.get()
}

/// Current metrics in the exposition format, empty before [`init`].
pub fn render() -> String {
    handle().map(PrometheusHandle::render).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn init_is_idempotent_and_renders() {
        init().unwrap();
        init().unwrap();
        metrics::counter!("feedhub_test_counter_total", 1);
        assert!(handle().is_some());
        assert!(render().contains("feedhub_test_counter_total"));
    }
}
