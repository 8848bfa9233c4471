//! Terminal-width aware tables.

use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};

/// Table sized to the terminal, or 120 columns when not on a TTY
pub fn new_table() -> Table {
    let width = crossterm::terminal::size()
        .map(|(w, _)| w)
        .unwrap_or(120);

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_width(width);
    table
}
