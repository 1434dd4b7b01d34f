use super::*;
use clap::Parser;

#[test]
fn test_parse_command_basic_controls() {
    assert_eq!(CliApp::parse_command("pause").unwrap(), RuntimeCommand::Pause);
    assert_eq!(CliApp::parse_command("resume").unwrap(), RuntimeCommand::Resume);
    assert_eq!(CliApp::parse_command("  status  ").unwrap(), RuntimeCommand::Status);
    assert_eq!(CliApp::parse_command("mute").unwrap(), RuntimeCommand::Mute(true));
    assert_eq!(CliApp::parse_command("unmute").unwrap(), RuntimeCommand::Mute(false));
    assert_eq!(CliApp::parse_command("reload").unwrap(), RuntimeCommand::Reload);
    assert_eq!(CliApp::parse_command("exit").unwrap(), RuntimeCommand::Quit);
}

#[test]
fn test_parse_command_empty_and_unknown() {
    assert!(matches!(CliApp::parse_command("   "), Err(ParseError::EmptyCommand)));
    assert!(matches!(
        CliApp::parse_command("rewind"),
        Err(ParseError::UnknownCommand { .. })
    ));
    assert!(matches!(CliApp::parse_command("help"), Err(ParseError::HelpRequested)));
}

#[test]
fn test_parse_command_seek() {
    assert_eq!(CliApp::parse_command("seek 1:30").unwrap(), RuntimeCommand::Seek(90.0));
    assert_eq!(CliApp::parse_command("seek 2.5s").unwrap(), RuntimeCommand::Seek(2.5));
    assert!(matches!(
        CliApp::parse_command("seek"),
        Err(ParseError::MissingArgument { .. })
    ));
    assert!(matches!(
        CliApp::parse_command("seek soon"),
        Err(ParseError::InvalidTimeFormat { .. })
    ));
}

#[test]
fn test_parse_command_speed_and_volume() {
    assert_eq!(CliApp::parse_command("speed 1.5").unwrap(), RuntimeCommand::Speed(1.5));
    assert!(matches!(
        CliApp::parse_command("speed 0"),
        Err(ParseError::InvalidArgument { .. })
    ));
    assert!(matches!(
        CliApp::parse_command("speed fast"),
        Err(ParseError::InvalidArgument { .. })
    ));

    assert_eq!(CliApp::parse_command("volume 150").unwrap(), RuntimeCommand::Volume(150.0));
    assert!(matches!(
        CliApp::parse_command("volume -3"),
        Err(ParseError::InvalidArgument { .. })
    ));
}

#[test]
fn test_parse_command_filters() {
    match CliApp::parse_command("af add @eq:volume=volume=0.5").unwrap() {
        RuntimeCommand::AddFilter(spec) => {
            assert_eq!(spec.name, "volume");
            assert_eq!(spec.label.as_deref(), Some("eq"));
            assert_eq!(spec.args.get("volume").map(String::as_str), Some("0.5"));
        }
        other => panic!("Expected AddFilter, got {:?}", other),
    }

    assert_eq!(
        CliApp::parse_command("af rm eq").unwrap(),
        RuntimeCommand::RemoveFilter("eq".to_string())
    );
    assert_eq!(
        CliApp::parse_command("af cmd softvol volume 0.5").unwrap(),
        RuntimeCommand::FilterCommand {
            label: "softvol".to_string(),
            name: "volume".to_string(),
            arg: "0.5".to_string(),
        }
    );
    assert_eq!(CliApp::parse_command("af list").unwrap(), RuntimeCommand::Chain);
    assert!(matches!(
        CliApp::parse_command("af cmd softvol volume"),
        Err(ParseError::MissingArgument { .. })
    ));
    assert!(matches!(
        CliApp::parse_command("af swap"),
        Err(ParseError::UnknownCommand { .. })
    ));
}

#[test]
fn test_parse_filter_spec() {
    let spec = parse_filter_spec("scaletempo").unwrap();
    assert_eq!(spec.name, "scaletempo");
    assert!(spec.label.is_none());
    assert!(spec.args.is_empty());
    assert!(spec.enabled);

    let spec = parse_filter_spec("@out:format=rate=48000:channels=2").unwrap();
    assert_eq!(spec.label.as_deref(), Some("out"));
    assert_eq!(spec.name, "format");
    assert_eq!(spec.args.len(), 2);
    assert_eq!(spec.args.get("rate").map(String::as_str), Some("48000"));

    assert!(parse_filter_spec("").is_err());
    assert!(parse_filter_spec("@:volume").is_err());
    assert!(parse_filter_spec("@label").is_err());
    assert!(parse_filter_spec("volume=loud").is_err());
}

#[test]
fn test_parse_format() {
    let format = parse_format("44100:s16:2").unwrap();
    assert_eq!(format.rate, 44100);
    assert_eq!(format.encoding, SampleEncoding::S16);
    assert_eq!(format.channel_count(), 2);
    assert!(format.is_valid());

    let hint = parse_format("48000::").unwrap();
    assert_eq!(hint.rate, 48000);
    assert!(!hint.encoding.is_known());
    assert!(!hint.channels.is_set());

    let hint = parse_format("::6").unwrap();
    assert_eq!(hint.rate, 0);
    assert_eq!(hint.channel_count(), 6);

    assert!(parse_format("48000:s24:2").is_err());
    assert!(parse_format("48000:float:0").is_err());
    assert!(parse_format("1:2:3:4").is_err());
}

#[test]
fn test_parse_time_formats() {
    assert_eq!(CliApp::parse_time("90").unwrap(), Duration::from_secs(90));
    assert_eq!(CliApp::parse_time("90s").unwrap(), Duration::from_secs(90));
    assert_eq!(CliApp::parse_time("1:30").unwrap(), Duration::from_secs(90));
    assert_eq!(CliApp::parse_time("0:00.5").unwrap(), Duration::from_millis(500));

    assert!(CliApp::parse_time("").is_err());
    assert!(CliApp::parse_time("1:60").is_err());
    assert!(CliApp::parse_time("1:2:3").is_err());
    assert!(CliApp::parse_time("-5").is_err());
}

#[test]
fn test_format_duration() {
    assert_eq!(CliApp::format_duration(Duration::from_millis(90_250)), "01:30.250");
    assert_eq!(CliApp::format_duration(Duration::ZERO), "00:00.000");
}

#[test]
fn test_clap_play_options() {
    let cli = CliApp::try_parse_from([
        "rpipe",
        "play",
        "song.flac",
        "--speed",
        "1.25",
        "--gapless",
        "strict",
        "--af",
        "@tempo:scaletempo",
        "--af",
        "volume=volume=2",
        "--end",
        "1:00",
        "--fast",
    ])
    .unwrap();

    match cli.command {
        Commands::Play { path, options } => {
            assert_eq!(path, "song.flac");
            assert_eq!(options.speed, Some(1.25));
            assert_eq!(options.gapless, Some(GaplessMode::Strict));
            assert_eq!(options.filters.len(), 2);
            assert_eq!(options.filters[0].label.as_deref(), Some("tempo"));
            assert_eq!(options.end, Some(60.0));
            assert!(options.fast);
            assert!(!options.interactive);
        }
        other => panic!("Expected Play, got {:?}", other),
    }
}

#[test]
fn test_clap_tone_defaults() {
    let cli = CliApp::try_parse_from(["rpipe", "--log-level", "debug", "tone"]).unwrap();
    assert_eq!(cli.log_level.as_deref(), Some("debug"));

    match cli.command {
        Commands::Tone {
            frequency,
            rate,
            channels,
            length,
            options,
        } => {
            assert_eq!(frequency, 440.0);
            assert_eq!(rate, 48000);
            assert_eq!(channels, 2);
            assert_eq!(length, 5.0);
            assert!(options.filters.is_empty());
        }
        other => panic!("Expected Tone, got {:?}", other),
    }
}

#[test]
fn test_clap_rejects_bad_values() {
    assert!(CliApp::try_parse_from(["rpipe", "tone", "--gapless", "sometimes"]).is_err());
    assert!(CliApp::try_parse_from(["rpipe", "negotiate", "--input", "fast"]).is_err());
    assert!(CliApp::try_parse_from(["rpipe", "negotiate"]).is_err());
}

#[test]
fn test_clap_negotiate() {
    let cli = CliApp::try_parse_from([
        "rpipe",
        "negotiate",
        "--input",
        "44100:s16:2",
        "--output",
        "48000::",
    ])
    .unwrap();

    match cli.command {
        Commands::Negotiate { input, output, filters } => {
            assert_eq!(input.rate, 44100);
            assert_eq!(output.map(|f| f.rate), Some(48000));
            assert!(filters.is_empty());
        }
        other => panic!("Expected Negotiate, got {:?}", other),
    }
}
