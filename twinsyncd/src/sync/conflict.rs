use time::OffsetDateTime;
use twinsync_core::{DataElement, ElementPath, PathError};

use super::job::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    Conflict,
    Deleted,
}

impl Marker {
    fn label(self) -> &'static str {
        match self {
            Marker::Conflict => "conflict",
            Marker::Deleted => "deleted",
        }
    }
}

/// Random id plus wall-clock stamp that make a marked name unique.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mark {
    pub id: String,
    pub stamp: String,
}

impl Mark {
    pub fn fresh() -> Self {
        Self {
            id: format!("{:08x}", rand::random::<u32>()),
            stamp: format_stamp(OffsetDateTime::now_utc()),
        }
    }
}

fn format_stamp(at: OffsetDateTime) -> String {
    format!(
        "{:04}{:02}{:02}-{:02}{:02}{:02}",
        at.year(),
        u8::from(at.month()),
        at.day(),
        at.hour(),
        at.minute(),
        at.second()
    )
}

/// `report.pdf` becomes `report (conflict 1a2b3c4d 20240101-120000).pdf`.
pub fn marked_name(name: &str, marker: Marker, mark: &Mark) -> String {
    let tag = format!("({} {} {})", marker.label(), mark.id, mark.stamp);
    if let Some((stem, ext)) = name.rsplit_once('.')
        && !stem.is_empty()
    {
        return format!("{stem} {tag}.{ext}");
    }
    format!("{name} {tag}")
}

pub fn marked_path(
    path: &ElementPath,
    marker: Marker,
    mark: &Mark,
) -> Result<ElementPath, PathError> {
    let name = path.name().ok_or(PathError::Root)?;
    path.with_name(&marked_name(name, marker, mark))
}

/// Picks the side whose version wins a conflict.
///
/// The side that moved further from its own baseline is newer. A missing
/// baseline counts as the largest possible change. With no baseline on
/// either side the absolute modification dates decide. Ties go to `source`.
pub fn newer_side(
    source: Side,
    source_live: &DataElement,
    source_base: Option<&DataElement>,
    dest_live: &DataElement,
    dest_base: Option<&DataElement>,
) -> Side {
    let delta = |live: &DataElement, base: Option<&DataElement>| {
        base.map(|base| live.modified.saturating_sub(base.modified))
    };
    let newer_is_dest = match (delta(source_live, source_base), delta(dest_live, dest_base)) {
        (None, None) => dest_live.modified > source_live.modified,
        (None, Some(_)) => false,
        (Some(_), None) => true,
        (Some(source_delta), Some(dest_delta)) => dest_delta > source_delta,
    };
    if newer_is_dest { source.other() } else { source }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn path(value: &str) -> ElementPath {
        ElementPath::parse(value).unwrap()
    }

    fn mark() -> Mark {
        Mark {
            id: "00ab".into(),
            stamp: "20240102-030405".into(),
        }
    }

    fn file(modified: i64) -> DataElement {
        DataElement::file(path("/f.txt"), 1, modified)
    }

    #[test]
    fn marker_goes_before_extension() {
        assert_eq!(
            marked_name("report.pdf", Marker::Conflict, &mark()),
            "report (conflict 00ab 20240102-030405).pdf"
        );
        assert_eq!(
            marked_name("notes", Marker::Deleted, &mark()),
            "notes (deleted 00ab 20240102-030405)"
        );
        assert_eq!(
            marked_name(".bashrc", Marker::Conflict, &mark()),
            ".bashrc (conflict 00ab 20240102-030405)"
        );
    }

    #[test]
    fn marked_path_stays_in_same_folder() {
        let marked = marked_path(&path("/docs/a.txt"), Marker::Conflict, &mark()).unwrap();
        assert_eq!(marked.parent(), Some(path("/docs")));
        assert!(marked_path(&ElementPath::root(), Marker::Conflict, &mark()).is_err());
    }

    #[test]
    fn stamp_is_sortable_utc_time() {
        assert_eq!(
            format_stamp(datetime!(2024-01-02 03:04:05 UTC)),
            "20240102-030405"
        );
    }

    #[test]
    fn larger_delta_wins() {
        assert_eq!(
            newer_side(Side::A, &file(150), Some(&file(100)), &file(300), Some(&file(200))),
            Side::B
        );
        assert_eq!(
            newer_side(Side::A, &file(500), Some(&file(100)), &file(300), Some(&file(200))),
            Side::A
        );
    }

    #[test]
    fn missing_baseline_is_maximal_change() {
        assert_eq!(
            newer_side(Side::A, &file(1), None, &file(900), Some(&file(100))),
            Side::A
        );
        assert_eq!(
            newer_side(Side::A, &file(900), Some(&file(100)), &file(1), None),
            Side::B
        );
    }

    #[test]
    fn absolute_dates_decide_without_baselines_and_ties_favor_source() {
        assert_eq!(newer_side(Side::B, &file(10), None, &file(20), None), Side::A);
        assert_eq!(newer_side(Side::B, &file(20), None, &file(20), None), Side::B);
        assert_eq!(
            newer_side(Side::B, &file(30), Some(&file(10)), &file(40), Some(&file(20))),
            Side::B
        );
    }
}
