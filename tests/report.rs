//! Report layouts produced by `Context::export`.

use histprof::{Context, Declaration, OutputFormat};

fn export(context: &Context, format: OutputFormat) -> String {
    let mut out = Vec::new();
    context.export(&mut out, format).expect("export failed");
    String::from_utf8(out).expect("report is not utf-8")
}

#[test]
fn test_columnar_rows_follow_longest_column() {
    for (a, b) in [(8, 8), (4, 12), (12, 4)] {
        let mut context: Context = Context::new();
        context
            .initialize(&[Declaration::new("a", 1, a), Declaration::new("b", 1, b)])
            .unwrap();
        context.input("a", 1);
        context.input("b", 2);

        let text = export(&context, OutputFormat::Columnar);
        let lines: Vec<&str> = text.lines().collect();

        let header: Vec<&str> = lines[0].split('\t').collect();
        assert_eq!(header.len(), 2);
        assert!(header[0].starts_with("a, #buckets: "));
        assert!(header[1].starts_with("b, #buckets: "));
        assert_eq!(lines.len() - 1, a.max(b));

        for row in &lines[1..] {
            assert_eq!(row.split('\t').count(), 2);
        }
    }
}

#[test]
fn test_columnar_groups_threads_under_label() {
    let mut context: Context = Context::new();
    context
        .initialize(&[Declaration::new("a", 1, 4), Declaration::new("b", 1, 4)])
        .unwrap();

    std::thread::scope(|s| {
        s.spawn(|| {
            context.input_for_current_thread("b", 1);
            context.input_for_current_thread("a", 1);
        });
    });

    let text = export(&context, OutputFormat::Columnar);
    let header: Vec<&str> = text.lines().next().unwrap().split('\t').collect();
    assert_eq!(header.len(), 4);
    assert!(header[0].starts_with("a, "));
    assert!(header[1].starts_with("a [ThreadId("));
    assert!(header[2].starts_with("b, "));
    assert!(header[3].starts_with("b [ThreadId("));
}

#[test]
fn test_sequential_blocks() {
    let mut context: Context = Context::new();
    context
        .initialize(&[Declaration::new("lat", 1000, 10)])
        .unwrap();
    for sample in [1500, 2500, 9999, 15000] {
        context.input("lat", sample);
    }

    let text = export(&context, OutputFormat::Sequential);
    let lines: Vec<&str> = text.lines().collect();

    assert_eq!(lines.len(), 1 + 10 + 1);
    assert_eq!(
        lines[0],
        "lat, #buckets: 10, #samples: 4, #overflows: 2, #underflows: 0, samples/bucket: 1000, \
         mean: 7249.750, std: 3.702, median: 3, min: 1500, max: 15000"
    );
    let buckets: Vec<u64> = lines[1..11].iter().map(|l| l.parse().unwrap()).collect();
    assert_eq!(buckets, vec![0, 0, 1, 1, 0, 0, 0, 0, 0, 3]);
    assert_eq!(lines[11], "");
}

#[test]
fn test_unsupported_format_falls_back_to_sequential() {
    let mut context: Context = Context::new();
    context
        .initialize(&[Declaration::new("x", 1, 2)])
        .unwrap();

    let format = OutputFormat::parse_or_default("pdf");
    assert_eq!(format, OutputFormat::Sequential);
    let text = export(&context, format);
    assert!(text.starts_with("x, #buckets: 2"));
}

#[test]
fn test_empty_context_exports_nothing() {
    let context: Context = Context::new();
    assert!(export(&context, OutputFormat::Sequential).is_empty());
    assert!(export(&context, OutputFormat::Columnar).is_empty());
}
