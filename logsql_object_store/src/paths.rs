use chrono::prelude::*;
use object_store::path::Path as ObjPath;
use std::ops::Deref;
use uuid::Uuid;

/// File extension for files holding JSON records
pub const PARQUET_FILE_EXTENSION: &str = "parquet";

/// File extension for files holding raw log lines
pub const RAW_FILE_EXTENSION: &str = "log";

/// How the records of a table's objects are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectFormat {
    /// JSON records, stored as parquet.
    Json,
    /// Text lines, stored as they were received.
    Raw,
}

impl ObjectFormat {
    pub const ALL: [Self; 2] = [Self::Json, Self::Raw];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Raw => "raw",
        }
    }

    pub fn file_extension(&self) -> &'static str {
        match self {
            Self::Json => PARQUET_FILE_EXTENSION,
            Self::Raw => RAW_FILE_EXTENSION,
        }
    }
}

impl std::fmt::Display for ObjectFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Directory holding every object of one table in one format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDirPath(ObjPath);

impl TableDirPath {
    pub fn new(prefix: &str, table: &str, format: ObjectFormat) -> Self {
        Self(ObjPath::from(format!("{prefix}/{table}.{format}")))
    }
}

impl Deref for TableDirPath {
    type Target = ObjPath;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<ObjPath> for TableDirPath {
    fn as_ref(&self) -> &ObjPath {
        &self.0
    }
}

/// Location of one committed batch:
/// `<prefix>/<table>.<format>/<UTC timestamp>/<id>.<extension>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectFilePath(ObjPath);

impl ObjectFilePath {
    pub fn new(
        prefix: &str,
        table: &str,
        format: ObjectFormat,
        time: DateTime<Utc>,
        id: Uuid,
    ) -> Self {
        let path = ObjPath::from(format!(
            "{prefix}/{table}.{format}/{}/{id}.{}",
            time.format("%Y%m%dT%H%M%SZ"),
            format.file_extension()
        ));
        Self(path)
    }
}

impl Deref for ObjectFilePath {
    type Target = ObjPath;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<ObjPath> for ObjectFilePath {
    fn as_ref(&self) -> &ObjPath {
        &self.0
    }
}

#[test]
fn table_dir_path_new() {
    assert_eq!(
        *TableDirPath::new("minsql", "weblog", ObjectFormat::Raw),
        ObjPath::from("minsql/weblog.raw")
    );
    assert_eq!(
        *TableDirPath::new("", "weblog", ObjectFormat::Json),
        ObjPath::from("weblog.json")
    );
}

#[test]
fn object_file_path_new() {
    let id = Uuid::parse_str("67e55044-10b1-426f-9247-bb680e5fe0c8").unwrap();
    assert_eq!(
        *ObjectFilePath::new(
            "minsql",
            "weblog",
            ObjectFormat::Json,
            Utc.with_ymd_and_hms(2038, 1, 19, 3, 14, 7).unwrap(),
            id,
        ),
        ObjPath::from(
            "minsql/weblog.json/20380119T031407Z/67e55044-10b1-426f-9247-bb680e5fe0c8.parquet"
        )
    );
}

#[test]
fn object_file_path_is_under_table_dir() {
    let path = ObjectFilePath::new(
        "a/b",
        "weblog",
        ObjectFormat::Raw,
        Utc::now(),
        Uuid::new_v4(),
    );
    let dir = TableDirPath::new("a/b", "weblog", ObjectFormat::Raw);
    assert!(path.prefix_matches(&dir));
    assert_eq!(path.extension(), Some(RAW_FILE_EXTENSION));
}
