pub mod actions;
pub mod admin;
pub mod breakers;
pub mod compliance;
pub mod emergency;
pub mod health;

mod response;

#[cfg(test)]
mod actions_http_tests;



#[cfg(test)]
mod emergency_http_tests;


#[cfg(test)]
mod test_support;

pub use actions::configure_action_routes;
pub use admin::configure_admin_routes;
pub use breakers::configure_breaker_routes;
pub use compliance::configure_compliance_routes;
pub use emergency::configure_emergency_routes;
pub use health::configure_health_routes;

/// Register every `/v1` route on `cfg`
pub fn configure_v1_routes(cfg: &mut actix_web::web::ServiceConfig) {
    configure_admin_routes(cfg);
    configure_emergency_routes(cfg);
    configure_action_routes(cfg);
    configure_breaker_routes(cfg);
    configure_compliance_routes(cfg);
}
