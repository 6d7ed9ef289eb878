use tracing::debug;

use super::publisher::Publisher;
use super::subscriber::Side;
use crate::store::{Command, Reply};
use crate::utils::BusError;

impl Publisher {
    /// Mark a claimed session as served and start its output idle clock.
    pub async fn set_live(&self, code: &str) -> Result<(), BusError> {
        self.exec(
            "set_live",
            vec![
                Command::hset(self.names.session(code), [("live", "true")]),
                Command::expire(self.names.output(code), self.settings.expiry()),
            ],
        )
        .await?;
        debug!(session = %code, "session live");
        Ok(())
    }

    pub async fn is_valid(&self, code: &str) -> Result<bool, BusError> {
        let reply = self
            .query("is_valid", Command::hget(self.names.session(code), "live"))
            .await?;
        Ok(matches!(reply, Reply::Bulk(live) if live == "true"))
    }

    pub async fn touch_input(&self, code: &str) -> Result<(), BusError> {
        self.touch(code, Side::Input).await
    }

    pub async fn touch_output(&self, code: &str) -> Result<(), BusError> {
        self.touch(code, Side::Output).await
    }

    /// Sessions that stop being touched expire after the configured window.
    async fn touch(&self, code: &str, side: Side) -> Result<(), BusError> {
        let expiry = self.settings.expiry();
        self.exec(
            "touch",
            vec![
                Command::expire(self.names.session(code), expiry),
                Command::expire(self.names.of(side.kind(), code), expiry),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn session_content(&self, code: &str) -> Result<Option<String>, BusError> {
        let reply = self
            .query(
                "session_content",
                Command::hget(self.names.session(code), "content"),
            )
            .await?;
        Ok(reply.into_string())
    }
}
