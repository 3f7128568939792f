/// Per-feature visibility.
///
/// Two independent axes: `logical` is user/theme intent and survives zoom
/// and filter changes; `current` is the projection actually drawn:
///
/// `current == logical && !filtered_out && within_zoom`
///
/// Every setter recomputes `current` and reports whether it flipped.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VisibilityState {
    logical: bool,
    filtered_out: bool,
    within_zoom: bool,
    current: bool,
}

impl VisibilityState {
    pub fn new() -> Self {
        Self {
            logical: true,
            filtered_out: false,
            within_zoom: true,
            current: true,
        }
    }

    pub fn logical(&self) -> bool {
        self.logical
    }

    pub fn filtered_out(&self) -> bool {
        self.filtered_out
    }

    pub fn within_zoom(&self) -> bool {
        self.within_zoom
    }

    pub fn current(&self) -> bool {
        self.current
    }

    pub fn set_logical(&mut self, logical: bool) -> bool {
        self.logical = logical;
        self.recompute()
    }

    pub fn set_filtered_out(&mut self, filtered_out: bool) -> bool {
        self.filtered_out = filtered_out;
        self.recompute()
    }

    pub fn set_within_zoom(&mut self, within_zoom: bool) -> bool {
        self.within_zoom = within_zoom;
        self.recompute()
    }

    fn recompute(&mut self) -> bool {
        let next = self.logical && !self.filtered_out && self.within_zoom;
        let changed = next != self.current;
        self.current = next;
        changed
    }
}

impl Default for VisibilityState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::VisibilityState;

    #[test]
    fn starts_visible() {
        let v = VisibilityState::new();
        assert!(v.logical());
        assert!(v.current());
    }

    #[test]
    fn current_requires_all_three_axes() {
        let mut v = VisibilityState::new();
        assert!(v.set_filtered_out(true));
        assert!(!v.current());
        assert!(!v.set_within_zoom(false));
        assert!(!v.set_filtered_out(false));
        assert!(!v.current());
        assert!(v.set_within_zoom(true));
        assert!(v.current());
    }

    #[test]
    fn zoom_never_touches_logical() {
        let mut v = VisibilityState::new();
        v.set_logical(false);
        v.set_within_zoom(false);
        v.set_within_zoom(true);
        assert!(!v.logical());
        assert!(!v.current());
    }
}
