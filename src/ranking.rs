//! Recommendation score and the two feed orderings built on top of it.

/// Maximum number of videos returned by the recommendation feed.
pub const RECOMMENDED_LIMIT: usize = 20;

/// Score used to rank videos in the recommendation feed.
///
/// Views weigh a tenth of a like. The value is always derived from the stored
/// counters and persisted next to them whenever either counter changes.
pub fn recommendation_score(likes: i64, views: i64) -> f64 {
    likes as f64 + views as f64 / 10.0
}

/// Orderings available when listing videos.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedOrder {
    /// Newest upload first. Used by the main feed and profiles.
    Newest,
    /// Highest score first, ties resolved by insertion order.
    Recommended,
}

impl FeedOrder {
    pub(crate) fn order_by(self) -> &'static str {
        match self {
            FeedOrder::Newest => "created_at DESC, id DESC",
            FeedOrder::Recommended => "recommendation_score DESC, id ASC",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_is_likes_plus_tenth_of_views() {
        assert_eq!(recommendation_score(0, 0), 0.0);
        assert_eq!(recommendation_score(1, 0), 1.0);
        assert_eq!(recommendation_score(2, 0), 2.0);
        assert_eq!(recommendation_score(0, 10), 1.0);
        assert_eq!(recommendation_score(3, 5), 3.5);
        assert_eq!(recommendation_score(7, 3), 7.0 + 3.0 / 10.0);
    }

    #[test]
    fn orderings_do_not_share_a_sort_key() {
        assert!(FeedOrder::Newest.order_by().starts_with("created_at"));
        assert!(
            FeedOrder::Recommended
                .order_by()
                .starts_with("recommendation_score")
        );
    }
}
