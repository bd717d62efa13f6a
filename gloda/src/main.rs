use tracing::{error, info, warn};

use gloda_datastore::config::{self, get_config};
use gloda_datastore::{init_tracing, Datastore};

const COUNTED_TABLES: &[&str] = &[
    "folderLocations",
    "conversations",
    "messages",
    "contacts",
    "identities",
    "attributeDefinitions",
];

#[tokio::main]
async fn main() {
    init_tracing();

    if let Err(e) = config::init_config() {
        warn!("Could not load config, using defaults: {}", e);
    }

    let datastore = match Datastore::open(get_config()) {
        Ok(datastore) => datastore,
        Err(e) => {
            error!("Failed to open datastore: {}", e);
            std::process::exit(1);
        }
    };

    info!("Datastore id: {}", datastore.datastore_id());
    if let Some(path) = datastore.path() {
        info!("Database file: {:?}", path);
    }

    for table in COUNTED_TABLES {
        let sql = format!("SELECT COUNT(*) FROM {}", table);
        match datastore
            .executor()
            .execute_sync(|conn| Ok(conn.query_row(&sql, [], |row| row.get::<_, i64>(0))?))
        {
            Ok(count) => info!("{}: {} rows", table, count),
            Err(e) => warn!("Could not count {}: {}", table, e),
        }
    }

    if let Err(e) = datastore.shutdown().await {
        error!("Shutdown failed: {}", e);
        std::process::exit(1);
    }
}
