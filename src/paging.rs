use serde::{Serialize, Serializer};

/// One slot in the visible page strip: a page number or an ellipsis gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageItem {
    Page(u64),
    Ellipsis,
}

impl Serialize for PageItem {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PageItem::Page(n) => serializer.serialize_u64(*n),
            PageItem::Ellipsis => serializer.serialize_str("..."),
        }
    }
}

/// How many pages to show on each side of the current page.
const WINDOW_RADIUS: u64 = 2;

#[derive(Debug, Clone, Copy)]
pub struct Pager {
    total_items: u64,
    items_per_page: u64,
    current_page: u64,
}

impl Pager {
    pub fn new(total_items: u64, items_per_page: u64) -> Self {
        Self {
            total_items,
            items_per_page: items_per_page.max(1),
            current_page: 1,
        }
    }

    pub fn total_items(&self) -> u64 {
        self.total_items
    }

    pub fn items_per_page(&self) -> u64 {
        self.items_per_page
    }

    pub fn current_page(&self) -> u64 {
        self.current_page
    }

    /// ceil(total_items / items_per_page). Zero for an empty collection.
    pub fn total_pages(&self) -> u64 {
        self.total_items.div_ceil(self.items_per_page)
    }

    fn page_bound(&self) -> u64 {
        self.total_pages().max(1)
    }

    /// Navigate to `page`. Out-of-range requests are ignored.
    pub fn set_page(&mut self, page: u64) {
        if page >= 1 && page <= self.page_bound() {
            self.current_page = page;
        }
    }

    /// Changing the page size always snaps back to the first page.
    #[allow(dead_code)]
    pub fn set_items_per_page(&mut self, items_per_page: u64) {
        self.items_per_page = items_per_page.max(1);
        self.current_page = 1;
    }

    /// Re-clamp after the underlying collection grows or shrinks.
    #[allow(dead_code)]
    pub fn set_total_items(&mut self, total_items: u64) {
        self.total_items = total_items;
        self.current_page = self.current_page.min(self.page_bound()).max(1);
    }

    /// 1-based inclusive index of the first item on the current page.
    pub fn start_item(&self) -> u64 {
        if self.total_items == 0 {
            return 0;
        }
        (self.current_page - 1) * self.items_per_page + 1
    }

    /// 1-based inclusive index of the last item on the current page.
    pub fn end_item(&self) -> u64 {
        if self.total_items == 0 {
            return 0;
        }
        (self.current_page * self.items_per_page).min(self.total_items)
    }

    /// First page, last page, and a window around the current page, with an
    /// ellipsis wherever consecutive shown numbers skip more than one page.
    pub fn visible_pages(&self) -> Vec<PageItem> {
        let total = self.total_pages();
        if total == 0 {
            return Vec::new();
        }
        let lo = self.current_page.saturating_sub(WINDOW_RADIUS);
        let hi = self.current_page + WINDOW_RADIUS;

        let mut items = Vec::new();
        let mut last_shown = 0u64;
        for p in 1..=total {
            let in_window = p >= lo && p <= hi;
            if p != 1 && p != total && !in_window {
                continue;
            }
            if last_shown != 0 && p - last_shown > 1 {
                items.push(PageItem::Ellipsis);
            }
            items.push(PageItem::Page(p));
            last_shown = p;
        }
        items
    }

    /// The current page's sub-range of an in-memory collection.
    pub fn slice<'a, T>(&self, items: &'a [T]) -> &'a [T] {
        if self.total_items == 0 {
            return &[];
        }
        let start = (self.start_item() - 1) as usize;
        let end = self.end_item() as usize;
        let start = start.min(items.len());
        let end = end.min(items.len());
        &items[start..end]
    }
}
