use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::models::FragmentMetadata;

/// Text payload fields a query can be narrowed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextField {
    SourceId,
    AlbumIdentifier,
    Artist,
}

impl TextField {
    pub fn payload_key(self) -> &'static str {
        match self {
            Self::SourceId => "source_id",
            Self::AlbumIdentifier => "album_identifier",
            Self::Artist => "artist",
        }
    }

    fn value(self, metadata: &FragmentMetadata) -> &str {
        match self {
            Self::SourceId => &metadata.source_id,
            Self::AlbumIdentifier => &metadata.album_identifier,
            Self::Artist => &metadata.artist,
        }
    }
}

/// Predicate over fragment metadata, evaluated by the index before ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetadataFilter {
    Equals { field: TextField, value: String },
    OneOf { field: TextField, values: Vec<String> },
    /// Inclusive bounds; fragments without a publication date never match a
    /// bounded range.
    PublishedWithin {
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    },
    All { filters: Vec<MetadataFilter> },
}

impl MetadataFilter {
    pub fn equals(field: TextField, value: impl Into<String>) -> Self {
        Self::Equals {
            field,
            value: value.into(),
        }
    }

    pub fn one_of<I, S>(field: TextField, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::OneOf {
            field,
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn published_within(from: Option<NaiveDate>, to: Option<NaiveDate>) -> Self {
        Self::PublishedWithin { from, to }
    }

    /// Conjunction, flattening nested `All`s.
    pub fn and(self, other: MetadataFilter) -> Self {
        let mut filters = match self {
            Self::All { filters } => filters,
            single => vec![single],
        };
        match other {
            Self::All { filters: more } => filters.extend(more),
            single => filters.push(single),
        }
        Self::All { filters }
    }

    /// True when no fragment can match: an empty `OneOf`, an inverted date
    /// range, or a conjunction containing either. Backends that cannot express
    /// these natively answer empty without asking the store.
    pub fn is_unsatisfiable(&self) -> bool {
        match self {
            Self::OneOf { values, .. } => values.is_empty(),
            Self::PublishedWithin {
                from: Some(from),
                to: Some(to),
            } => from > to,
            Self::All { filters } => filters.iter().any(Self::is_unsatisfiable),
            _ => false,
        }
    }

    pub fn matches(&self, metadata: &FragmentMetadata) -> bool {
        match self {
            Self::Equals { field, value } => field.value(metadata) == value,
            Self::OneOf { field, values } => {
                let actual = field.value(metadata);
                values.iter().any(|v| v == actual)
            }
            Self::PublishedWithin { from: None, to: None } => true,
            Self::PublishedWithin { from, to } => match metadata.publication_date {
                Some(date) => {
                    from.map_or(true, |f| date >= f) && to.map_or(true, |t| date <= t)
                }
                None => false,
            },
            Self::All { filters } => filters.iter().all(|f| f.matches(metadata)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(artist: &str, date: Option<NaiveDate>) -> FragmentMetadata {
        FragmentMetadata {
            source_id: "u1".into(),
            album_identifier: format!("{}/lp", artist.to_lowercase()),
            artist: artist.into(),
            album_title: "LP".into(),
            publication_date: date,
            position_index: 0,
            text: "text".into(),
            model_version: "m1".into(),
        }
    }

    fn day(y: i32, m: u32, d: u32) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(y, m, d)
    }

    #[test]
    fn test_equality_and_membership() {
        let m = meta("Slowdive", day(1993, 5, 17));
        assert!(MetadataFilter::equals(TextField::Artist, "Slowdive").matches(&m));
        assert!(!MetadataFilter::equals(TextField::Artist, "Ride").matches(&m));
        assert!(MetadataFilter::one_of(TextField::Artist, ["Ride", "Slowdive"]).matches(&m));
        assert!(!MetadataFilter::one_of(TextField::Artist, Vec::<String>::new()).matches(&m));
    }

    #[test]
    fn test_date_range_is_inclusive() {
        let m = meta("Slowdive", day(1993, 5, 17));
        assert!(MetadataFilter::published_within(day(1993, 5, 17), day(1993, 5, 17)).matches(&m));
        assert!(MetadataFilter::published_within(None, day(1999, 1, 1)).matches(&m));
        assert!(!MetadataFilter::published_within(day(2000, 1, 1), None).matches(&m));
    }

    #[test]
    fn test_undated_fragment_fails_bounded_range() {
        let m = meta("Slowdive", None);
        assert!(!MetadataFilter::published_within(day(1990, 1, 1), None).matches(&m));
        assert!(MetadataFilter::published_within(None, None).matches(&m));
    }

    #[test]
    fn test_conjunction_flattens() {
        let f = MetadataFilter::equals(TextField::Artist, "Slowdive")
            .and(MetadataFilter::published_within(day(1990, 1, 1), None))
            .and(MetadataFilter::one_of(TextField::SourceId, ["u1"]));
        match &f {
            MetadataFilter::All { filters } => assert_eq!(filters.len(), 3),
            other => panic!("unexpected {:?}", other),
        }
        assert!(f.matches(&meta("Slowdive", day(1993, 5, 17))));
        assert!(!f.matches(&meta("Slowdive", day(1989, 5, 17))));
    }

    #[test]
    fn test_unsatisfiable_filters_match_nothing() {
        let dated = meta("Slowdive", day(1993, 5, 17));
        let undated = meta("Ride", None);
        let empty = MetadataFilter::one_of(TextField::AlbumIdentifier, Vec::<String>::new());
        let inverted = MetadataFilter::published_within(day(2000, 1, 1), day(1990, 1, 1));
        let nested = MetadataFilter::equals(TextField::Artist, "Slowdive").and(empty.clone());

        for f in [&empty, &inverted, &nested] {
            assert!(f.is_unsatisfiable(), "{:?}", f);
            assert!(!f.matches(&dated));
            assert!(!f.matches(&undated));
        }
        assert!(!MetadataFilter::one_of(TextField::Artist, ["Ride"]).is_unsatisfiable());
        assert!(!MetadataFilter::published_within(day(1990, 1, 1), day(1990, 1, 1)).is_unsatisfiable());
    }

    #[test]
    fn test_tagged_serialization() {
        let f = MetadataFilter::equals(TextField::AlbumIdentifier, "ride/nowhere");
        let json = serde_json::to_value(&f).unwrap();
        assert_eq!(json["kind"], "equals");
        assert_eq!(json["field"], "album_identifier");
        let back: MetadataFilter = serde_json::from_value(json).unwrap();
        assert_eq!(back, f);
    }
}
