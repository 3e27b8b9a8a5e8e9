use rocket::fairing::{Fairing, Info, Kind};
use rocket::{Data, Request, Response};
use std::time::Instant;

/// Fairing logging one line per HTTP request with its duration.
///
/// Health probes log at debug so polling load balancers do not drown the
/// import progress lines; server errors log at warn.
pub struct RequestLogger;

#[rocket::async_trait]
impl Fairing for RequestLogger {
    fn info(&self) -> Info {
        Info {
            name: "Request Logger",
            kind: Kind::Request | Kind::Response,
        }
    }

    async fn on_request(&self, request: &mut Request<'_>, _: &mut Data<'_>) {
        request.local_cache(Instant::now);
    }

    async fn on_response<'r>(&self, request: &'r Request<'_>, response: &mut Response<'r>) {
        let elapsed_ms = request.local_cache(Instant::now).elapsed().as_secs_f64() * 1000.0;
        let method = request.method();
        let path = request.uri().path();
        let status = response.status();

        if status.code >= 500 {
            log::warn!("{} {} -> {} ({:.2}ms)", method, path, status.code, elapsed_ms);
        } else if path.as_str().contains("/health") {
            log::debug!("{} {} -> {} ({:.2}ms)", method, path, status.code, elapsed_ms);
        } else {
            log::info!("{} {} -> {} ({:.2}ms)", method, path, status.code, elapsed_ms);
        }
    }
}
