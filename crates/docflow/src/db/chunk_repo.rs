//! Vector chunk repository: records of points stored in the vector index.

use rusqlite::{params, Row};

use super::{Database, DatabaseError};

/// A raw vector chunk row.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRow {
    pub id: String,
    pub document_id: String,
    pub user_id: String,
    pub point_id: String,
    pub content: String,
    pub chunk_index: u32,
    pub page_number: Option<u32>,
    pub created_at: String,
}

impl ChunkRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            document_id: row.get("document_id")?,
            user_id: row.get("user_id")?,
            point_id: row.get("point_id")?,
            content: row.get("content")?,
            chunk_index: row.get("chunk_index")?,
            page_number: row.get("page_number")?,
            created_at: row.get("created_at")?,
        })
    }
}

/// Replaces all chunk rows of a document in one transaction.
pub fn replace_for_document(
    db: &Database,
    document_id: &str,
    chunks: &[ChunkRow],
) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM vector_chunks WHERE document_id = ?1",
            params![document_id],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO vector_chunks (id, document_id, user_id, point_id, content,
                 chunk_index, page_number, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for chunk in chunks {
                stmt.execute(params![
                    chunk.id,
                    chunk.document_id,
                    chunk.user_id,
                    chunk.point_id,
                    chunk.content,
                    chunk.chunk_index,
                    chunk.page_number,
                    chunk.created_at,
                ])?;
            }
        }
        tx.commit()?;
        Ok(chunks.len())
    })
}

/// Lists a document's chunks in index order.
pub fn list_by_document(db: &Database, document_id: &str) -> Result<Vec<ChunkRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM vector_chunks WHERE document_id = ?1 ORDER BY chunk_index ASC",
        )?;
        let rows = stmt
            .query_map(params![document_id], ChunkRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO documents (id, user_id, filename, checksum, created_at, updated_at)
                 VALUES ('doc-1', 'user-1', 'a.txt', 'abc', 't', 't')",
                [],
            )?;
            Ok(())
        })
        .unwrap();
        db
    }

    fn chunk(index: u32) -> ChunkRow {
        ChunkRow {
            id: format!("c{}", index),
            document_id: "doc-1".to_string(),
            user_id: "user-1".to_string(),
            point_id: format!("p{}", index),
            content: format!("chunk {}", index),
            chunk_index: index,
            page_number: Some(1),
            created_at: "t".to_string(),
        }
    }

    #[test]
    fn test_replace_for_document() {
        let db = test_db();
        replace_for_document(&db, "doc-1", &[chunk(1), chunk(0)]).unwrap();
        let rows = list_by_document(&db, "doc-1").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].chunk_index, 0);

        // A second embed replaces rather than appends.
        let mut replacement = chunk(0);
        replacement.id = "c0-new".to_string();
        replace_for_document(&db, "doc-1", &[replacement]).unwrap();
        let rows = list_by_document(&db, "doc-1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "c0-new");
    }
}
