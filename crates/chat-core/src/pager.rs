use crate::{
    reconcile::HistoryPlacement,
    types::{HistoryPage, HistoryQuery, PageSelector, ScrollDirective},
};

/// Messages per history page.
pub const DEFAULT_PAGE_SIZE: u16 = 50;
/// Largest page the server serves.
pub const SERVER_PAGE_CAP: u16 = 100;

/// Clamp a requested page size into `1..=100`.
pub fn bounded_page_limit(requested: u16) -> u16 {
    requested.clamp(1, SERVER_PAGE_CAP)
}

/// Request currently awaiting a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagerRequest {
    Initial,
    Older { page: u32 },
}

/// How a completed page lands in the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLanding {
    pub placement: HistoryPlacement,
    pub scroll: ScrollDirective,
    pub has_more: bool,
}

/// Tracks backward pagination through room history.
#[derive(Debug, Clone)]
pub struct HistoryPager {
    page_size: u16,
    current_page: Option<u32>,
    has_more: bool,
    in_flight: Option<PagerRequest>,
}

impl HistoryPager {
    pub fn new(page_size: u16) -> Self {
        Self {
            page_size: bounded_page_limit(page_size),
            current_page: None,
            has_more: false,
            in_flight: None,
        }
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn current_page(&self) -> Option<u32> {
        self.current_page
    }

    pub fn in_flight(&self) -> Option<PagerRequest> {
        self.in_flight
    }

    /// Query for the newest page, or `None` while another request runs.
    pub fn load_initial(&mut self) -> Option<HistoryQuery> {
        if self.in_flight.is_some() {
            return None;
        }
        self.in_flight = Some(PagerRequest::Initial);
        Some(HistoryQuery {
            selector: PageSelector::Last,
            limit: self.page_size,
        })
    }

    /// Query for the page before the oldest loaded one.
    ///
    /// `None` while a request runs, before the initial page landed, or when
    /// nothing older exists.
    pub fn load_older(&mut self) -> Option<HistoryQuery> {
        if self.in_flight.is_some() || !self.has_more {
            return None;
        }
        let page = self.current_page?.checked_sub(1)?;
        self.in_flight = Some(PagerRequest::Older { page });
        Some(HistoryQuery {
            selector: PageSelector::Page(page),
            limit: self.page_size,
        })
    }

    /// Record a response. Returns `None` if nothing was in flight.
    pub fn complete(&mut self, response: &HistoryPage) -> Option<PageLanding> {
        match self.in_flight.take()? {
            PagerRequest::Initial => {
                self.has_more = match (response.page, response.total_pages) {
                    (Some(page), Some(total_pages)) => match response.has_more {
                        Some(has_more) => has_more || page > 0,
                        None => total_pages > 1,
                    },
                    _ => false,
                };
                self.current_page = response
                    .page
                    .or_else(|| response.total_pages.map(|total| total.saturating_sub(1)));
                Some(PageLanding {
                    placement: HistoryPlacement::Initial,
                    scroll: ScrollDirective::Bottom,
                    has_more: self.has_more,
                })
            }
            PagerRequest::Older { page } => {
                self.current_page = Some(page);
                self.has_more = response.has_more.unwrap_or(page > 0);
                Some(PageLanding {
                    placement: HistoryPlacement::Older,
                    scroll: ScrollDirective::PreserveTopAnchor,
                    has_more: self.has_more,
                })
            }
        }
    }

    /// Record a failed request. A failed older page hides the affordance.
    pub fn fail(&mut self) {
        if let Some(PagerRequest::Older { .. }) = self.in_flight.take() {
            self.has_more = false;
        }
    }
}

impl Default for HistoryPager {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_SIZE)
    }
}

/// Scrollable surface that hosts the timeline.
pub trait Viewport {
    fn scroll_top(&self) -> f64;
    fn scroll_height(&self) -> f64;
    fn set_scroll_top(&mut self, value: f64);
}

/// Run `prepend` and keep the previously topmost message at the same visual
/// offset by shifting the scroll position by the height delta.
pub fn preserve_scroll_anchor<V: Viewport>(viewport: &mut V, prepend: impl FnOnce(&mut V)) {
    let prev_top = viewport.scroll_top();
    let prev_height = viewport.scroll_height();
    prepend(viewport);
    let delta = viewport.scroll_height() - prev_height;
    viewport.set_scroll_top(prev_top + delta);
}
