use crate::LOG;

/// Request logging middleware. Logs method, path, response status,
/// and handler duration for every request.
pub struct LogMiddleware {
    _priv: (),
}

impl LogMiddleware {
    pub fn new() -> Self {
        Self { _priv: () }
    }
}

#[async_trait::async_trait]
impl<State: Clone + Send + Sync + 'static> tide::Middleware<State> for LogMiddleware {
    async fn handle(
        &self,
        req: tide::Request<State>,
        next: tide::Next<'_, State>,
    ) -> tide::Result {
        let method = req.method().to_string();
        let path = req.url().path().to_string();
        let start = std::time::Instant::now();
        let resp = next.run(req).await;
        slog::info!(
            LOG, "request";
            "method" => method,
            "path" => path,
            "status" => u16::from(resp.status()),
            "ms" => start.elapsed().as_millis() as u64,
        );
        Ok(resp)
    }
}
