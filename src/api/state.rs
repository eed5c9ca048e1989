use crate::application::ReadApi;
use metrics_exporter_prometheus::PrometheusHandle;

#[derive(Clone)]
pub struct AppState {
    pub read_api: ReadApi,
    /// Handle of the process-wide Prometheus recorder
    pub metrics: PrometheusHandle,
}
