use uuid::Uuid;

/// A fresh identifier for a logical connection. Random (v4) UUIDs make collisions between
///  concurrently running clients of the same server practically impossible.
pub fn unique_id() -> String {
    Uuid::new_v4().to_string()
}
