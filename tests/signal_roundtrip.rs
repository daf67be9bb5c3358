//! Black-box scenarios for the signal parser's public contract.

use schmux::signal::{extract_and_strip, parse, SignalState};

#[test]
fn test_osc_notification_extraction() {
    let input = b"Building...\x1b]777;notify;completed;Build successful\x07\n$ ";
    let (signals, stripped) = extract_and_strip(input);

    assert_eq!(signals.len(), 1);
    assert_eq!(signals[0].state, SignalState::Completed);
    assert_eq!(signals[0].message, "Build successful");
    assert_eq!(stripped, b"Building...\n$ ");
}

#[test]
fn test_inline_bracket_marker_is_not_a_signal() {
    let input = b"start--<[schmux:completed:msg]>--end";
    let (signals, stripped) = extract_and_strip(input);

    assert!(signals.is_empty());
    assert_eq!(stripped, input);
}

#[test]
fn test_bracket_marker_with_embedded_ansi() {
    let input = "⏺ --<[schmux:completed:Task\x1b[1Cfinished]>--\n".as_bytes();
    let (signals, _) = extract_and_strip(input);

    assert_eq!(signals.len(), 1);
    assert_eq!(signals[0].state, SignalState::Completed);
    assert_eq!(signals[0].message, "Task finished");

    // An unrecognized leading glyph means the marker is not alone on its
    // line, so nothing is extracted
    let foreign = "► --<[schmux:completed:Task finished]>--\n".as_bytes();
    let (none, unchanged) = extract_and_strip(foreign);
    assert!(none.is_empty());
    assert_eq!(unchanged, foreign);
}

#[test]
fn test_strip_then_rescan_is_empty() {
    let input = concat!(
        "plain output\n",
        "\u{1b}]777;notify;working;step one\u{07}",
        "⏺ --<[schmux:needs_testing:try `cargo run`]>--\n",
        "\u{1b}]777;notify;mystery;kept\u{07}",
        "more output\n",
    )
    .as_bytes();

    let (signals, stripped) = extract_and_strip(input);
    assert_eq!(signals.len(), 2);
    assert_eq!(signals[0].state, SignalState::Working);
    assert_eq!(signals[1].state, SignalState::NeedsTesting);

    // Unrecognized OSC-777 notification survives the strip
    let text = String::from_utf8_lossy(&stripped);
    assert!(text.contains("mystery"));

    let (rescan, unchanged) = extract_and_strip(&stripped);
    assert!(rescan.is_empty());
    assert_eq!(unchanged, stripped);
}

#[test]
fn test_parse_agrees_with_extract() {
    let input = b"a\x1b]777;notify;error;boom\x07b\n--<[schmux:working:wip]>--\n";
    let parsed = parse(input);
    let (extracted, _) = extract_and_strip(input);

    assert_eq!(parsed.len(), extracted.len());
    for (a, b) in parsed.iter().zip(extracted.iter()) {
        assert_eq!(a.state, b.state);
        assert_eq!(a.message, b.message);
    }
}
