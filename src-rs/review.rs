use anyhow::Result;
use std::io::{BufRead, Write};

use crate::catalog::Catalog;
use crate::records::{AnnotationRecord, FORM_FIELDS};
use crate::session::{DeleteOutcome, Position, ReviewSession, SubmitOutcome};
use crate::storage::ObjectStore;

pub const REVIEW_HELP: &str = r#"Commands:
  show                  show the current image and its form
  set <field> <value>   fill a form field
  submit                save the form for the current image and advance
  delete                exclude the current image from labeling and advance
  next | back           move to the next / previous image
  folder <name>         switch to another dataset folder
  refresh               re-list images and reload documents
  status                print progress counts
  help                  print this help
  quit                  leave the review loop"#;

/// Line-oriented review loop. Each command runs to completion before the
/// next line is read; failures are printed and the loop keeps going.
pub fn run_review<S, R, W>(catalog: &mut Catalog<S>, folder: &str, input: R, out: &mut W) -> Result<()>
where
    S: ObjectStore,
    R: BufRead,
    W: Write,
{
    let mut session = ReviewSession::open(catalog, folder)?;
    let mut draft = fresh_draft(&session);
    show(&session, draft.as_ref(), out)?;

    for line in input.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (command, rest) = line
            .split_once(char::is_whitespace)
            .map(|(command, rest)| (command, rest.trim()))
            .unwrap_or((line, ""));

        match command {
            "quit" | "exit" => break,
            "help" => writeln!(out, "{REVIEW_HELP}")?,
            "show" => show(&session, draft.as_ref(), out)?,
            "status" => {
                let status = session.status();
                writeln!(
                    out,
                    "{}: {} images, {} annotated, {} deleted, {} remaining",
                    status.folder, status.images, status.annotated, status.deleted, status.remaining
                )?;
            }
            "next" | "back" => {
                if command == "next" {
                    session.next();
                } else {
                    session.back();
                }
                draft = fresh_draft(&session);
                show(&session, draft.as_ref(), out)?;
            }
            "set" => {
                let Some(form) = draft.as_mut() else {
                    writeln!(out, "nothing to annotate")?;
                    continue;
                };
                let (field, value) = rest
                    .split_once(char::is_whitespace)
                    .map(|(field, value)| (field, value.trim()))
                    .unwrap_or((rest, ""));
                match form.set_field(field, value) {
                    Ok(()) => writeln!(out, "{field} = {value}")?,
                    Err(err) => writeln!(out, "error: {err}")?,
                }
            }
            "submit" => {
                let Some(form) = draft.take() else {
                    writeln!(out, "nothing to annotate")?;
                    continue;
                };
                match session.submit(catalog.store(), form.clone()) {
                    Ok(SubmitOutcome::Saved(reports)) => {
                        for report in &reports {
                            writeln!(out, "saved {} ({} records)", report.canonical_path, report.records)?;
                        }
                        draft = fresh_draft(&session);
                        show(&session, draft.as_ref(), out)?;
                    }
                    Ok(SubmitOutcome::AlreadyAnnotated) => {
                        writeln!(
                            out,
                            "info: {} is already annotated; edit it through grid-save or raw-save",
                            form.id
                        )?;
                        draft = Some(form);
                    }
                    Err(err) => {
                        writeln!(out, "error: {err:#}")?;
                        draft = Some(form);
                    }
                }
            }
            "delete" => {
                let Some(id) = session.current().map(|image| image.id.clone()) else {
                    writeln!(out, "nothing to delete")?;
                    continue;
                };
                match session.delete(catalog.store(), &id) {
                    Ok(DeleteOutcome::Saved(reports)) => {
                        for report in &reports {
                            writeln!(out, "saved {} ({} records)", report.canonical_path, report.records)?;
                        }
                        draft = fresh_draft(&session);
                        show(&session, draft.as_ref(), out)?;
                    }
                    Ok(DeleteOutcome::AlreadyDeleted) => writeln!(out, "info: {id} is already excluded")?,
                    Err(err) => writeln!(out, "error: {err:#}")?,
                }
            }
            "folder" | "refresh" => {
                let target = if command == "refresh" {
                    catalog.refresh(Some(session.folder()));
                    session.folder().to_string()
                } else if rest.is_empty() {
                    writeln!(out, "usage: folder <name>")?;
                    continue;
                } else {
                    rest.to_string()
                };
                match session.select_folder(catalog, &target) {
                    Ok(()) => {
                        draft = fresh_draft(&session);
                        show(&session, draft.as_ref(), out)?;
                    }
                    Err(err) => writeln!(out, "error: {err:#}")?,
                }
            }
            other => writeln!(out, "unknown command {other:?}; type help")?,
        }
    }
    Ok(())
}

/// Form for the current image, prefilled when it was annotated before.
fn fresh_draft(session: &ReviewSession) -> Option<AnnotationRecord> {
    let image = session.current()?;
    Some(
        session
            .annotation(&image.id)
            .cloned()
            .unwrap_or_else(|| AnnotationRecord::blank(image)),
    )
}

fn show<W: Write>(session: &ReviewSession, draft: Option<&AnnotationRecord>, out: &mut W) -> Result<()> {
    let (index, image, form) = match (session.position(), session.current(), draft) {
        (Position::At(index), Some(image), Some(form)) => (index, image, form),
        _ => {
            writeln!(out, "All images in {} are processed.", session.folder())?;
            return Ok(());
        }
    };

    let marker = if session.is_processed(&image.id) {
        " (processed)"
    } else {
        ""
    };
    writeln!(
        out,
        "[{}/{}] {}{marker}",
        index + 1,
        session.images().len(),
        image.id
    )?;
    writeln!(out, "  image: {}", image.url)?;
    for field in FORM_FIELDS {
        writeln!(out, "  {field}: {}", form.field(field).unwrap_or_default())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalBucket;
    use serde_json::Value;
    use std::io::Cursor;
    use tempfile::tempdir;

    fn run(catalog: &mut Catalog<LocalBucket>, script: &str) -> String {
        let mut out = Vec::new();
        run_review(catalog, "set1", Cursor::new(script.to_string()), &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    fn catalog(root: &std::path::Path) -> Catalog<LocalBucket> {
        let bucket = LocalBucket::new(root, "data", Some("https://cdn.test".into()));
        for path in ["set1/a.jpg", "set1/b.png", "set2/z.jpg"] {
            bucket.upload(path, b"img", true).unwrap();
        }
        Catalog::new(bucket)
    }

    #[test]
    fn annotate_delete_and_finish() {
        let dir = tempdir().unwrap();
        let mut catalog = catalog(dir.path());
        let output = run(
            &mut catalog,
            "set text_original بسم الله\nset ayah_number 1\nsubmit\ndelete\nnext\nquit\n",
        );

        assert!(output.starts_with("[1/2] a\n"));
        assert!(output.contains("text_original = بسم الله"));
        assert!(output.contains("saved set1_annotations/annotations.json (1 records)"));
        assert!(output.contains("[2/2] b\n"));
        assert!(output.contains("saved set1_annotations/deleted.json (1 records)"));
        assert!(output.trim_end().ends_with("All images in set1 are processed."));

        let saved: Value = serde_json::from_slice(
            &catalog.store().download("set1_annotations/annotations.json").unwrap(),
        )
        .unwrap();
        assert_eq!(saved[0]["text_original"], "بسم الله");
        assert_eq!(saved[0]["ayah_number"], "1");
    }

    #[test]
    fn revisiting_a_processed_image_reports_duplicate() {
        let dir = tempdir().unwrap();
        let mut catalog = catalog(dir.path());
        let output = run(
            &mut catalog,
            "set comment first\nsubmit\nback\nset comment second\nsubmit\nstatus\n",
        );
        assert!(output.contains("[1/2] a (processed)"));
        assert!(output.contains("  comment: first"));
        assert!(output.contains("info: a is already annotated"));
        assert!(output.contains("set1: 2 images, 1 annotated, 0 deleted, 1 remaining"));
    }

    #[test]
    fn bad_input_keeps_the_loop_running() {
        let dir = tempdir().unwrap();
        let mut catalog = catalog(dir.path());
        let output = run(&mut catalog, "set colour red\nfrobnicate\nfolder\nfolder set2\n");
        assert!(output.contains("error: unknown field `colour`"));
        assert!(output.contains("unknown command \"frobnicate\""));
        assert!(output.contains("usage: folder <name>"));
        assert!(output.contains("[1/1] z\n"));
    }

    #[test]
    fn refresh_sees_new_images() {
        let dir = tempdir().unwrap();
        let mut catalog = catalog(dir.path());
        let output = run(&mut catalog, "delete\ndelete\n");
        assert!(output.contains("All images in set1 are processed."));

        catalog.store().upload("set1/c.jpg", b"img", true).unwrap();
        let output = run(&mut catalog, "refresh\n");
        assert!(output.contains("[3/3] c\n"));
    }
}
