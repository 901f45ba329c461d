//! Control request command.

use clap::Args;
use stratum_config::{ParamConfig, RequestConfig, TopologyValidator};
use stratum_core::ParamValue;
use stratum_core::ctl::name_of;

use super::common::{build_topology, parse_key_val};

#[derive(Args)]
pub struct CtlArgs {
    /// Topology name or path to build first
    topology: String,

    /// Target class
    class: String,

    /// Verb (create, destroy, configure, list, or a class verb)
    verb: String,

    /// Parameter as key=value (repeatable)
    #[arg(short, long = "param", value_parser = parse_key_val)]
    params: Vec<(String, String)>,

    /// Print the configuration dump after the request
    #[arg(long)]
    dump: bool,
}

pub fn run(args: CtlArgs) -> anyhow::Result<()> {
    let request = args.params.iter().fold(
        RequestConfig::new(&args.class, &args.verb),
        |req, (key, value)| req.with_param(key.as_str(), ParamConfig::Text(value.clone())),
    );
    TopologyValidator::new().validate_request(&request)?;

    let (_, mesh) = build_topology(&args.topology)?;
    let req = mesh.control(request.to_request());
    if let Some(message) = req.error_message() {
        anyhow::bail!("{} {}: {message}", args.class, args.verb);
    }
    mesh.settle()?;

    if let Some(output) = req.text(name_of::OUTPUT) {
        print!("{output}");
    }
    for param in req.params() {
        let sent = request.param(&param.name).is_some();
        let internal = [name_of::CLASS, name_of::VERB, name_of::OUTPUT].contains(&param.name.as_str());
        if sent || internal {
            continue;
        }
        match &param.value {
            ParamValue::Int(v) => println!("{} = {v}", param.name),
            ParamValue::Text(s) => println!("{} = {s}", param.name),
            ParamValue::Blob(b) => println!("{} = <{} bytes>", param.name, b.len()),
            ParamValue::List(l) => println!("{} = <{} items>", param.name, l.len()),
        }
    }
    // Parameters the class rewrote, such as a generated name.
    for (name, value) in &request.params {
        if let (Some(ParamValue::Text(now)), ParamConfig::Text(before)) = (req.param(name), value)
            && now != before
        {
            println!("{name} = {now}");
        }
    }

    if args.dump {
        print!("{}", mesh.dump_conf());
    }
    Ok(())
}
