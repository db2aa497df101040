use tabled::{settings::Style, Table, Tabled};

use crate::storage::AllowEntry;

#[derive(Tabled)]
struct SettingRow<'a> {
    #[tabled(rename = "Setting")]
    setting: &'a str,
    #[tabled(rename = "Value")]
    value: &'a str,
}

#[derive(Tabled)]
struct EntryRow<'a> {
    #[tabled(rename = "Player")]
    username: &'a str,
    #[tabled(rename = "Added")]
    added_at: &'a str,
}

fn rounded<T: Tabled>(rows: Vec<T>) -> String {
    if rows.is_empty() {
        return String::new();
    }
    Table::new(rows).with(Style::rounded()).to_string()
}

/// Two-column `Setting | Value` table for `status`
pub fn settings_table(settings: &[(&str, &str)]) -> String {
    rounded(
        settings
            .iter()
            .map(|&(setting, value)| SettingRow { setting, value })
            .collect(),
    )
}

pub fn entries_table(entries: &[AllowEntry]) -> String {
    rounded(
        entries
            .iter()
            .map(|e| EntryRow {
                username: &e.username,
                added_at: &e.added_at,
            })
            .collect(),
    )
}
