use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Mutex;

/// Serial output sink: every block write is `---\n` followed by the block's
/// bytes, guarded by a single mutex so concatenated blocks never interleave
/// even when several workers race to write one.
pub struct OutputWriter {
    sink: Mutex<Box<dyn Write + Send>>,
}

impl OutputWriter {
    pub fn open(path: &str) -> std::io::Result<Self> {
        let sink: Box<dyn Write + Send> = if path == "/dev/stdout" || path == "-" {
            Box::new(std::io::stdout())
        } else {
            Box::new(BufWriter::new(File::create(path)?))
        };
        Ok(OutputWriter { sink: Mutex::new(sink) })
    }

    /// Writes one YAML block, preceded by its `---\n` separator, as a single
    /// atomic write with respect to other callers.
    pub fn write_block(&self, yaml: &str) -> std::io::Result<()> {
        let mut sink = self.sink.lock().expect("output writer mutex poisoned");
        sink.write_all(b"---\n")?;
        sink.write_all(yaml.as_bytes())?;
        if !yaml.ends_with('\n') {
            sink.write_all(b"\n")?;
        }
        Ok(())
    }

    pub fn flush(&self) -> std::io::Result<()> {
        self.sink.lock().expect("output writer mutex poisoned").flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn blocks_are_never_interleaved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.yaml");
        let writer = Arc::new(OutputWriter::open(path.to_str().unwrap()).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let writer = writer.clone();
                thread::spawn(move || {
                    writer.write_block(&format!("doc: {i}\nmore: {i}\nlines: {i}\n")).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        writer.flush().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let separators = contents.matches("---\n").count();
        assert_eq!(separators, 8);

        for block in contents.split("---\n").filter(|b| !b.is_empty()) {
            let lines: Vec<&str> = block.lines().collect();
            assert_eq!(lines.len(), 3, "a block from one writer must not be split by another's write");
            let doc_n: Vec<&str> = lines[0].splitn(2, ": ").collect();
            assert!(lines[1].ends_with(doc_n[1]));
            assert!(lines[2].ends_with(doc_n[1]));
        }
    }
}
