pub mod buf;
pub mod unique_id;
