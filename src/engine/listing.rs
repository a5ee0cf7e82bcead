use std::cmp::Ordering;

use ulid::Ulid;

use crate::limits::{MAX_PAGE_LIMIT, MAX_SEARCH_LEN};
use crate::model::*;

use super::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

/// A column a listing can search or sort on.
pub trait Field: Copy + std::fmt::Debug {
    const ENTITY: &'static str;
    fn parse(name: &str) -> Option<Self>;
    /// Only text columns take part in `field:term` search.
    fn searchable(self) -> bool;
}

pub trait Row<F: Field> {
    fn id(&self) -> Ulid;
    fn text(&self, field: F) -> Option<&str>;
    fn compare(&self, other: &Self, field: F) -> Ordering;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceField {
    Name,
    Address,
    City,
    State,
}

impl Field for PlaceField {
    const ENTITY: &'static str = "place";

    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "name" => PlaceField::Name,
            "address" => PlaceField::Address,
            "city" => PlaceField::City,
            "state" => PlaceField::State,
            _ => return None,
        })
    }

    fn searchable(self) -> bool {
        true
    }
}

impl Row<PlaceField> for PlaceView {
    fn id(&self) -> Ulid {
        self.place.id
    }

    fn text(&self, field: PlaceField) -> Option<&str> {
        let p = &self.place;
        Some(match field {
            PlaceField::Name => &p.name,
            PlaceField::Address => &p.address,
            PlaceField::City => &p.city,
            PlaceField::State => &p.state,
        })
    }

    fn compare(&self, other: &Self, field: PlaceField) -> Ordering {
        self.text(field).cmp(&other.text(field))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventField {
    Event,
    Type,
    Email,
    Phone,
    DateStart,
    DateEnd,
    CreatedAt,
    UpdatedAt,
}

impl Field for EventField {
    const ENTITY: &'static str = "event";

    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "event" => EventField::Event,
            "type" => EventField::Type,
            "email" => EventField::Email,
            "phone" => EventField::Phone,
            "date_start" | "dateStart" => EventField::DateStart,
            "date_end" | "dateEnd" => EventField::DateEnd,
            "created_at" | "createdAt" => EventField::CreatedAt,
            "updated_at" | "updatedAt" => EventField::UpdatedAt,
            _ => return None,
        })
    }

    fn searchable(self) -> bool {
        matches!(
            self,
            EventField::Event | EventField::Type | EventField::Email | EventField::Phone
        )
    }
}

impl Row<EventField> for Event {
    fn id(&self) -> Ulid {
        self.id
    }

    fn text(&self, field: EventField) -> Option<&str> {
        match field {
            EventField::Event => Some(&self.event),
            EventField::Type => Some(&self.kind),
            EventField::Email => Some(&self.email),
            EventField::Phone => Some(&self.phone),
            _ => None,
        }
    }

    fn compare(&self, other: &Self, field: EventField) -> Ordering {
        match field {
            EventField::DateStart => self.window.start.cmp(&other.window.start),
            EventField::DateEnd => self.window.end.cmp(&other.window.end),
            EventField::CreatedAt => self.created_at.cmp(&other.created_at),
            EventField::UpdatedAt => self.updated_at.cmp(&other.updated_at),
            text => self.text(text).cmp(&other.text(text)),
        }
    }
}

/// Validated list parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Params<F> {
    /// Field plus lowercased term.
    pub search: Option<(F, String)>,
    pub order: (F, Direction),
    pub page: u32,
    pub limit: u32,
}

impl<F: Field> Params<F> {
    pub fn parse(q: &ListQuery, default_order: F, default_limit: u32) -> Result<Self, EngineError> {
        let search = q.search.as_deref().map(parse_search::<F>).transpose()?.flatten();
        let order = match q.order.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(raw) => parse_order::<F>(raw)?,
            None => (default_order, Direction::Asc),
        };
        let page = q.page.unwrap_or(1);
        if page == 0 {
            return Err(EngineError::InvalidInput("page starts at 1".into()));
        }
        let limit = q.limit.unwrap_or(default_limit);
        if limit == 0 {
            return Err(EngineError::InvalidInput("limit must be positive".into()));
        }
        if limit > MAX_PAGE_LIMIT {
            return Err(EngineError::LimitExceeded("page limit too large"));
        }
        Ok(Self {
            search,
            order,
            page,
            limit,
        })
    }
}

/// `field:term`. Text after the first colon is the term, colons included.
/// A blank field or term means no filter.
fn parse_search<F: Field>(raw: &str) -> Result<Option<(F, String)>, EngineError> {
    if raw.len() > MAX_SEARCH_LEN {
        return Err(EngineError::LimitExceeded("search text too long"));
    }
    let Some((field, term)) = raw.split_once(':') else {
        return Ok(None);
    };
    let (field, term) = (field.trim(), term.trim());
    if field.is_empty() || term.is_empty() {
        return Ok(None);
    }
    match F::parse(field) {
        Some(f) if f.searchable() => Ok(Some((f, term.to_lowercase()))),
        _ => Err(EngineError::InvalidInput(format!(
            "cannot search {} by {field:?}",
            F::ENTITY
        ))),
    }
}

/// `field direction`, direction optional and case-insensitive.
fn parse_order<F: Field>(raw: &str) -> Result<(F, Direction), EngineError> {
    let mut parts = raw.split_whitespace();
    let name = parts.next().unwrap_or_default();
    let field = F::parse(name).ok_or_else(|| {
        EngineError::InvalidInput(format!("cannot order {} by {name:?}", F::ENTITY))
    })?;
    let direction = match parts.next().map(str::to_ascii_lowercase).as_deref() {
        None | Some("asc") => Direction::Asc,
        Some("desc") => Direction::Desc,
        Some(other) => {
            return Err(EngineError::InvalidInput(format!(
                "order direction must be asc or desc, got {other:?}"
            )));
        }
    };
    if parts.next().is_some() {
        return Err(EngineError::InvalidInput(format!("malformed order {raw:?}")));
    }
    Ok((field, direction))
}

/// Filter, sort, and cut one page out of `rows`.
pub fn paginate<F: Field, T: Row<F>>(mut rows: Vec<T>, params: &Params<F>) -> Page<T> {
    if let Some((field, term)) = &params.search {
        rows.retain(|r| {
            r.text(*field)
                .is_some_and(|t| t.to_lowercase().contains(term.as_str()))
        });
    }
    let (field, direction) = params.order;
    rows.sort_by(|a, b| {
        let ord = a.compare(b, field).then_with(|| a.id().cmp(&b.id()));
        match direction {
            Direction::Asc => ord,
            Direction::Desc => ord.reverse(),
        }
    });

    let total = rows.len();
    let skip = (u64::from(params.page) - 1) * u64::from(params.limit);
    let data = rows
        .into_iter()
        .skip(usize::try_from(skip).unwrap_or(usize::MAX))
        .take(params.limit as usize)
        .collect();
    Page {
        data,
        total,
        page: params.page,
        limit: params.limit,
        total_pages: total.div_ceil(params.limit as usize) as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(name: &str, city: &str) -> PlaceView {
        PlaceView {
            place: Place {
                id: Ulid::new(),
                name: name.into(),
                address: format!("{name} street"),
                city: city.into(),
                state: "SP".into(),
            },
            gates: Vec::new(),
            turnstiles: Vec::new(),
        }
    }

    fn query(search: Option<&str>, order: Option<&str>, page: Option<u32>, limit: Option<u32>) -> ListQuery {
        ListQuery {
            search: search.map(Into::into),
            order: order.map(Into::into),
            page,
            limit,
        }
    }

    fn names(page: &Page<PlaceView>) -> Vec<&str> {
        page.data.iter().map(|v| v.place.name.as_str()).collect()
    }

    fn sample() -> Vec<PlaceView> {
        vec![
            view("Stadium", "Rio"),
            view("Arena A", "Sao Paulo"),
            view("Hall", "Sao Paulo"),
            view("arena b", "Curitiba"),
        ]
    }

    #[test]
    fn defaults_sort_by_name_ascending() {
        let p = Params::parse(&ListQuery::default(), PlaceField::Name, 100).unwrap();
        let page = paginate(sample(), &p);
        assert_eq!(names(&page), ["Arena A", "Hall", "Stadium", "arena b"]);
        assert_eq!((page.total, page.page, page.limit, page.total_pages), (4, 1, 100, 1));
    }

    #[test]
    fn search_is_case_insensitive_substring() {
        let p = Params::parse(&query(Some("name:ARENA"), None, None, None), PlaceField::Name, 100).unwrap();
        let page = paginate(sample(), &p);
        assert_eq!(names(&page), ["Arena A", "arena b"]);
        assert_eq!(page.total, 2);
    }

    #[test]
    fn search_on_other_field_and_order_desc() {
        let q = query(Some("city:paulo"), Some("name desc"), None, None);
        let p = Params::parse(&q, PlaceField::Name, 100).unwrap();
        assert_eq!(names(&paginate(sample(), &p)), ["Hall", "Arena A"]);
    }

    #[test]
    fn search_term_keeps_extra_colons() {
        let p: Params<PlaceField> =
            Params::parse(&query(Some("address:a:b"), None, None, None), PlaceField::Name, 10).unwrap();
        assert_eq!(p.search, Some((PlaceField::Address, "a:b".into())));
    }

    #[test]
    fn blank_search_is_ignored() {
        for raw in ["name:", ":term", "noseparator", ""] {
            let p: Params<PlaceField> =
                Params::parse(&query(Some(raw), None, None, None), PlaceField::Name, 10).unwrap();
            assert!(p.search.is_none(), "{raw:?}");
        }
    }

    #[test]
    fn unknown_fields_rejected() {
        let bad_search = query(Some("password:x"), None, None, None);
        assert!(matches!(
            Params::parse(&bad_search, PlaceField::Name, 10),
            Err(EngineError::InvalidInput(_))
        ));
        let bad_order = query(None, Some("id; drop"), None, None);
        assert!(matches!(
            Params::parse(&bad_order, PlaceField::Name, 10),
            Err(EngineError::InvalidInput(_))
        ));
        let bad_dir = query(None, Some("name sideways"), None, None);
        assert!(Params::parse(&bad_dir, PlaceField::Name, 10).is_err());
    }

    #[test]
    fn event_dates_sort_but_do_not_search() {
        assert!(Params::<EventField>::parse(&query(None, Some("date_start DESC"), None, None), EventField::Event, 10).is_ok());
        assert!(Params::<EventField>::parse(&query(Some("date_start:2099"), None, None, None), EventField::Event, 10).is_err());
    }

    #[test]
    fn pagination_envelope() {
        let rows: Vec<PlaceView> = (0..25).map(|i| view(&format!("p{i:02}"), "x")).collect();
        let p = Params::parse(&query(None, None, Some(3), Some(10)), PlaceField::Name, 10).unwrap();
        let page = paginate(rows, &p);
        assert_eq!(page.data.len(), 5);
        assert_eq!(page.data[0].place.name, "p20");
        assert_eq!((page.total, page.total_pages), (25, 3));
    }

    #[test]
    fn page_past_the_end_is_empty() {
        let p = Params::parse(&query(None, None, Some(9), Some(10)), PlaceField::Name, 10).unwrap();
        let page = paginate(sample(), &p);
        assert!(page.data.is_empty());
        assert_eq!(page.total, 4);
        assert_eq!(page.total_pages, 1);
    }

    #[test]
    fn zero_page_or_limit_rejected() {
        assert!(Params::parse(&query(None, None, Some(0), None), PlaceField::Name, 10).is_err());
        assert!(Params::parse(&query(None, None, None, Some(0)), PlaceField::Name, 10).is_err());
        assert!(matches!(
            Params::parse(&query(None, None, None, Some(MAX_PAGE_LIMIT + 1)), PlaceField::Name, 10),
            Err(EngineError::LimitExceeded(_))
        ));
    }
}
