use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::api::handlers::health_handler,
        crate::api::handlers::metrics_handler,
        crate::api::handlers::catalogue_handler,
        crate::api::handlers::latest_handler,
        crate::api::handlers::previous_handler,
        crate::api::handlers::range_handler,
        crate::api::handlers::daily_figures_handler
    ),
    components(
        schemas(
            crate::api::handlers::HealthResponse,
            crate::api::handlers::MetricInfo,
            crate::api::handlers::ErrorResponse,
            crate::application::Observation,
            crate::application::SeriesPoint,
            crate::application::MetricSummary,
            crate::application::DailyFigures
        )
    ),
    tags(
        (name = "system", description = "Health and Prometheus metrics"),
        (name = "series", description = "Daily case and death statistics for Germany")
    ),
    info(
        title = "COVID-19 Statistics API",
        description = "Daily cases and deaths published by the RKI, with moving means, incidences and reproduction numbers"
    )
)]
pub struct ApiDoc;
