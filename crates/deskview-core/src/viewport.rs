/// Rows of headroom between the bottom of the visible range and the loaded
/// boundary before another page is requested.
pub const DEFAULT_OVERSCAN: usize = 10;

/// Projects a virtualizer's visible index range into a status line and the
/// load-more trigger decision. The virtualizer itself lives outside the
/// core; it only reports `(first, last)` here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewportWindow {
    first: usize,
    last: usize,
    overscan: usize,
    item_label: String,
}

impl ViewportWindow {
    pub fn new(item_label: impl Into<String>) -> Self {
        Self {
            first: 0,
            last: 0,
            overscan: DEFAULT_OVERSCAN,
            item_label: item_label.into(),
        }
    }

    pub fn with_overscan(mut self, overscan: usize) -> Self {
        self.overscan = overscan;
        self
    }

    pub fn on_visible_range_changed(&mut self, first: usize, last: usize) {
        self.first = first;
        self.last = last.max(first);
    }

    pub fn visible_range(&self) -> (usize, usize) {
        (self.first, self.last)
    }

    /// `"{n} {label}(s)"` once the whole collection is loaded (or the total
    /// is unknown), `"Viewing {a}-{b} of {total} {label}(s)"` while more
    /// remain. Singular exactly when the displayed count is 1.
    pub fn status_text(&self, loaded_count: usize, total_count: Option<usize>) -> String {
        match total_count {
            Some(total) if loaded_count < total => {
                let first = self.first + 1;
                let last = (self.last + 1).min(total);
                format!(
                    "Viewing {first}-{last} of {total} {}",
                    pluralize(&self.item_label, total)
                )
            }
            Some(total) => format!("{total} {}", pluralize(&self.item_label, total)),
            None => format!("{loaded_count} {}", pluralize(&self.item_label, loaded_count)),
        }
    }

    /// True when the visible window is within the overscan threshold of the
    /// loaded boundary, more records remain, and no fetch is in flight.
    pub fn should_load_more(&self, loaded_count: usize, has_more: bool, in_flight: bool) -> bool {
        if !has_more || in_flight || loaded_count == 0 {
            return false;
        }
        self.last + self.overscan >= loaded_count - 1
    }
}

fn pluralize(label: &str, count: usize) -> String {
    if count == 1 {
        label.to_string()
    } else {
        format!("{label}s")
    }
}
