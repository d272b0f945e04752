use prometheus::{Encoder, TextEncoder};
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

/// Renders every registered collector in the Prometheus text format.
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

pub fn metrics_route(path: String) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    warp::path(path)
        .and(warp::path::end())
        .and(warp::get())
        .map(|| match render() {
            Ok(text) => warp::reply::with_header(text, "content-type", prometheus::TEXT_FORMAT)
                .into_response(),
            Err(e) => warp::reply::with_status(e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_core_collectors() {
        luma_trace_core::metrics::SPANS_ACCEPTED.inc_by(0);
        let text = render().unwrap();
        assert!(text.contains("luma_trace_spans_accepted_total"));
    }
}
