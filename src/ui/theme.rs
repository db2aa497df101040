use owo_colors::Style;
use std::sync::OnceLock;

use crate::gate::Decision;

static THEME: OnceLock<Theme> = OnceLock::new();

/// Styles keyed by what the CLI reports, not by color
#[derive(Debug, Clone)]
pub struct Theme {
    pub title: Style,
    /// Permitted names and successful commands
    pub granted: Style,
    /// Denied names and refused commands
    pub refused: Style,
    pub failure: Style,
    pub note: Style,
    pub label: Style,
}

impl Theme {
    /// Colored only on a terminal, and never with `NO_COLOR` set.
    pub fn detect() -> Self {
        Self::new(std::env::var_os("NO_COLOR").is_none() && console::Term::stdout().is_term())
    }

    pub fn new(color: bool) -> Self {
        let pick = |style: Style| if color { style } else { Style::new() };
        Self {
            title: pick(Style::new().cyan().bold()),
            granted: pick(Style::new().green().bold()),
            refused: pick(Style::new().yellow().bold()),
            failure: pick(Style::new().red().bold()),
            note: pick(Style::new().magenta()),
            label: pick(Style::new().white().dimmed()),
        }
    }

    pub fn decision(&self, decision: &Decision) -> Style {
        match decision {
            Decision::Permit => self.granted,
            Decision::Deny(_) => self.refused,
        }
    }
}

pub fn theme() -> &'static Theme {
    THEME.get_or_init(Theme::detect)
}
