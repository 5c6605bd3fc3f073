use rusqlite_migration::{M, Migrations};

pub fn migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(
        "CREATE TABLE documents (
            key             TEXT PRIMARY KEY,
            payload         TEXT NOT NULL,
            fingerprint     TEXT NOT NULL,
            created_at      INTEGER NOT NULL,
            updated_at      INTEGER NOT NULL
        );

        CREATE INDEX idx_documents_updated_at ON documents(updated_at);",
    )])
}
