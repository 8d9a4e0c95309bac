use std::env;
use std::path::Path;
use studygate::persistence::{DocumentStore, MemoryDocumentStore};

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: inspect_snapshot <path_to_documents.bin> [owner_id]");
        return;
    }
    let path = Path::new(&args[1]);

    let store = match MemoryDocumentStore::load_from_path(path) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Error loading snapshot: {}", e);
            return;
        }
    };

    println!("Snapshot Summary for {:?}", path);
    println!("----------------------------------------");
    println!("Total Documents: {}", store.len());
    println!("----------------------------------------\n");

    let Some(owner) = args.get(2) else {
        return;
    };

    match store.list(owner).await {
        Ok(records) => {
            for record in records {
                println!("ID: {}", record.id);
                println!("  File:    {} ({})", record.filename, record.content_type);
                match record.file_size {
                    Some(size) => println!("  Size:    {} bytes", size),
                    None => println!("  Size:    [not written]"),
                }
                println!("  Session: {}", record.session_id.as_deref().unwrap_or("-"));
                println!("  Created: {}", record.created_at.to_rfc3339());
                println!();
            }
        }
        Err(e) => eprintln!("Error listing documents for {}: {}", owner, e),
    }
}
