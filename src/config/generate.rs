pub fn generate_starter_config() -> String {
    r#"# =============================================================================
# INGESTOR CONFIGURATION
# =============================================================================
# Accepts metrics one at a time over HTTP, queues them in memory and writes
# them to DuckDB in transactional batches.
#
# Config file locations (in order of precedence):
#   1. Path specified via --config argument
#   2. ~/.config/ingestor/config.yml
#   3. /etc/ingestor/config.yml
#
# Values may reference environment variables as $env{VAR_NAME}.

# =============================================================================
# INGEST PIPELINE
# =============================================================================

ingest:
  # Capacity of the in-memory intake queue. When it is full, new metrics are
  # rejected immediately (the caller sees accepted=false); nothing blocks.
  buffer_limit: 10000
  # Flush as soon as this many metrics are waiting
  batch_size: 100
  # Flush whatever is waiting at least this often (ms, s, m, h)
  flush_interval: 1s
  # Give up on a single batch write after this long; the batch is discarded
  flush_timeout: 5s
  # On shutdown, also write metrics that are still queued (default: abandon them)
  drain_queue_on_shutdown: false

# =============================================================================
# STORAGE SETTINGS
# =============================================================================

storage:
  # Path to DuckDB database file
  path: ~/.local/share/ingestor/metrics.duckdb

# =============================================================================
# WEB SERVER SETTINGS
# =============================================================================
# Serves POST /api/metrics, GET /api/metrics, GET /api/stats and GET /health.

web:
  listen: 127.0.0.1:7300
  # Set to 0.0.0.0:7300 to allow external connections
"#
    .to_string()
}
