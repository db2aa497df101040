pub mod icons;
pub mod output;
pub mod table;
pub mod theme;

pub use icons::Icons;
pub use output::{decision, dim, error, header, info, reply, section, success, summary_row, warn};
pub use table::{entries_table, settings_table};
pub use theme::{theme, Theme};
