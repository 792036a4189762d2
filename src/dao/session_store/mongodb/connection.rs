use std::time::Duration;

use mongodb::{Client, Database, bson::doc, options::ClientOptions};
use tokio::time::sleep;
use tracing::debug;

use super::error::{MongoDaoError, MongoResult};

const MAX_PINGS: u32 = 10;
const FIRST_DELAY: Duration = Duration::from_millis(250);
const MAX_DELAY: Duration = Duration::from_secs(5);

/// Pauses between startup pings: doubling from 250ms, capped at 5s, for 10 pings.
#[derive(Debug)]
struct PingBackoff {
    failures: u32,
    delay: Duration,
}

impl PingBackoff {
    fn new() -> Self {
        Self {
            failures: 0,
            delay: FIRST_DELAY,
        }
    }

    /// Record a failed ping. `None` once the budget is spent.
    fn after_failure(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.failures >= MAX_PINGS {
            return None;
        }
        let pause = self.delay;
        self.delay = (self.delay * 2).min(MAX_DELAY);
        Some(pause)
    }
}

/// Build a client and ping the database until it answers or the budget runs out.
pub async fn establish_connection(
    options: &ClientOptions,
    database_name: &str,
) -> MongoResult<(Client, Database)> {
    let client = Client::with_options(options.clone())
        .map_err(|source| MongoDaoError::ClientConstruction { source })?;
    let database = client.database(database_name);

    let mut backoff = PingBackoff::new();
    while let Err(err) = database.run_command(doc! { "ping": 1 }).await {
        let Some(pause) = backoff.after_failure() else {
            return Err(MongoDaoError::InitialPing {
                attempts: backoff.failures,
                source: err,
            });
        };
        debug!(attempts = backoff.failures, error = %err, "MongoDB not reachable yet");
        sleep(pause).await;
    }

    Ok((client, database))
}
