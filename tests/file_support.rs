//! Binary document support: PDF and DOCX sources flow through extraction,
//! indexing, and retrieval the same way plain text does.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use tempfile::TempDir;

use dossier::config::{
    ChunkingConfig, Config, DbConfig, EmbeddingConfig, FilesConfig, JobsConfig, OracleConfig,
    RetrievalConfig, ServerConfig, WorkersConfig,
};
use dossier::db::Store;
use dossier::embedding::HashEmbedder;
use dossier::engine::Engine;
use dossier::loader::load_text;
use dossier::migrate::run_migrations;
use dossier::models::{DocumentScope, DocumentStatus, JobStatus};
use dossier::retrieve::retrieve;

/// Minimal single-page PDF containing `phrase`, built with correct xref byte
/// offsets so the extractor can parse it.
fn minimal_pdf(phrase: &str) -> Vec<u8> {
    let content = format!("BT /F1 12 Tf 100 700 Td ({}) Tj ET\n", phrase);
    let mut out = Vec::new();
    out.extend_from_slice(b"%PDF-1.4\n");
    let mut offsets = Vec::new();

    offsets.push(out.len());
    out.extend_from_slice(b"1 0 obj << /Type /Catalog /Pages 2 0 R >> endobj\n");
    offsets.push(out.len());
    out.extend_from_slice(b"2 0 obj << /Type /Pages /Kids [3 0 R] /Count 1 >> endobj\n");
    offsets.push(out.len());
    out.extend_from_slice(
        b"3 0 obj << /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents 4 0 R /Resources << /Font << /F1 5 0 R >> >> >> endobj\n",
    );
    offsets.push(out.len());
    out.extend_from_slice(
        format!(
            "4 0 obj << /Length {} >> stream\n{}endstream endobj\n",
            content.len(),
            content
        )
        .as_bytes(),
    );
    offsets.push(out.len());
    out.extend_from_slice(b"5 0 obj << /Type /Font /Subtype /Type1 /BaseFont /Helvetica >> endobj\n");

    let xref_start = out.len();
    out.extend_from_slice(b"xref\n0 6\n");
    out.extend_from_slice(b"0000000000 65535 f \n");
    for offset in &offsets {
        out.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes());
    }
    out.extend_from_slice(b"trailer << /Size 6 /Root 1 0 R >>\nstartxref\n");
    out.extend_from_slice(format!("{}\n%%EOF\n", xref_start).as_bytes());
    out
}

/// Minimal DOCX (ZIP with `word/document.xml`) containing one paragraph.
fn minimal_docx(phrase: &str) -> Vec<u8> {
    let mut buf = Vec::new();
    {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        writer
            .start_file("word/document.xml", zip::write::SimpleFileOptions::default())
            .unwrap();
        let xml = format!(
            "<?xml version=\"1.0\"?><w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\"><w:body><w:p><w:r><w:t>{}</w:t></w:r></w:p></w:body></w:document>",
            phrase
        );
        writer.write_all(xml.as_bytes()).unwrap();
        writer.finish().unwrap();
    }
    buf
}

fn test_config(root: PathBuf) -> Config {
    Config {
        db: DbConfig {
            path: root.join("data").join("test.sqlite"),
        },
        chunking: ChunkingConfig::default(),
        retrieval: RetrievalConfig::default(),
        embedding: EmbeddingConfig::default(),
        oracle: OracleConfig::default(),
        workers: WorkersConfig::default(),
        jobs: JobsConfig::default(),
        files: FilesConfig {
            root: root.clone(),
            include_globs: vec!["**/*.pdf".to_string(), "**/*.docx".to_string()],
            exclude_globs: Vec::new(),
        },
        server: ServerConfig {
            bind: "127.0.0.1:0".to_string(),
        },
    }
}

async fn wait_for_job(engine: &Engine, job_id: &str) -> dossier::models::Job {
    for _ in 0..500 {
        let job = engine.tracker().get(job_id).await.unwrap();
        if job.status.is_terminal() {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("job {} did not finish", job_id);
}

#[test]
fn pdf_text_is_extracted() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("note.pdf");
    std::fs::write(&path, minimal_pdf("quarterly compliance review")).unwrap();

    let text = load_text(&path).unwrap();
    assert!(text.contains("quarterly compliance review"));
}

#[test]
fn docx_text_is_extracted() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("note.docx");
    std::fs::write(&path, minimal_docx("delaware limited partnership")).unwrap();

    let text = load_text(&path).unwrap();
    assert!(text.contains("delaware limited partnership"));
}

#[tokio::test]
async fn pdf_document_indexes_and_retrieves() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path().to_path_buf());
    let store = Store::open(&config).await.unwrap();
    run_migrations(&store).await.unwrap();
    let engine = Engine::new(config, store.clone()).unwrap();

    let path = tmp.path().join("overview.pdf");
    std::fs::write(&path, minimal_pdf("the custodian is First Meridian Bank")).unwrap();

    let (document, job) = engine
        .index_document_async(&path.to_string_lossy(), "Overview PDF")
        .await
        .unwrap();
    let job = wait_for_job(&engine, &job.id).await;
    assert_eq!(job.status, JobStatus::Completed);

    let document = dossier::indexer::get_document(&store, &document.id).await.unwrap();
    assert_eq!(document.status, DocumentStatus::Indexed);
    assert!(document.chunk_count >= 1);

    let embedder = HashEmbedder::new(384);
    let evidence = retrieve(
        &store,
        &embedder,
        "Who is the custodian?",
        &DocumentScope::ALL,
        3,
    )
    .await
    .unwrap();
    assert!(!evidence.is_empty());
    assert_eq!(evidence[0].document_name, "Overview PDF");
    assert!(evidence[0].text.contains("custodian"));

    engine.close().await;
}
