use std::env;
use std::fs::File;
use std::io::prelude::*;
use std::process;

use clap::{Arg, ArgAction, Command};
use rpassword::read_password;

use kdbx3::{read_database_file, Entry, Group, Key, ReadOptions};

fn main() {
    env_logger::init();

    let options = Command::new("KDBX Dump")
        .version("0.1.0")
        .author("Loren M. Lang <lorenl@north-winds.org>")
        .about("Dumping KDBX 3.x password files")
        .help_template(
            "{name} {version}\n\
             {author-with-newline}\
             {about-with-newline}\n\
             {usage-heading} {usage}\n\n\
             {all-args}",
        )
        .arg(
            Arg::new("key")
                .short('k')
                .long("key-file")
                .help("Key file for unlocking database"),
        )
        .arg(
            Arg::new("strict")
                .long("strict")
                .action(ArgAction::SetTrue)
                .help("Fail on structural anomalies instead of repairing them"),
        )
        .arg(
            Arg::new("file")
                .help("Password database")
                .required(true)
                .index(1),
        )
        .get_matches();

    let filename = options.get_one::<String>("file").expect("missing filename");

    let mut key = Key::new();
    let user_password = match env::var("KDBX_PASSWORD") {
        Ok(password) => password,
        Err(env::VarError::NotPresent) => {
            eprint!("Password: ");
            read_password().expect("Failed to read password")
        }
        Err(env::VarError::NotUnicode(_)) => {
            eprintln!("Invalid password");
            process::exit(1);
        }
    };
    key.set_user_password(user_password);

    if let Some(filename) = options.get_one::<String>("key") {
        let mut contents = vec![];
        if let Err(err) = File::open(filename).and_then(|mut f| f.read_to_end(&mut contents)) {
            eprintln!("Failed to read key file {}: {}", filename, err);
            process::exit(1);
        }
        key.set_keyfile(contents);
    }

    let read_options = ReadOptions {
        strict: options.get_flag("strict"),
        keep_on_xml_error: false,
    };
    let db = match read_database_file(filename, &key, &read_options) {
        Ok(db) => db,
        Err(err) => {
            eprintln!("{}", err);
            process::exit(1);
        }
    };

    if !db.meta.database_name.is_empty() {
        println!("Database: {}", db.meta.database_name);
    }
    dump_group(db.root_group(), 0);

    println!("Done!");
}

fn dump_group(group: &Group, depth: usize) {
    println!("{}+ {}", "  ".repeat(depth), group.name);
    for entry in &group.entries {
        dump_entry(entry, depth + 1);
    }
    for child in &group.groups {
        dump_group(child, depth + 1);
    }
}

fn dump_entry(entry: &Entry, depth: usize) {
    let indent = "  ".repeat(depth);
    println!("{}- {}", indent, entry.title());
    if !entry.username().is_empty() {
        println!("{}  user: {}", indent, entry.username());
    }
    if !entry.tags.is_empty() {
        println!("{}  tags: {}", indent, entry.tags);
    }
    for name in entry.attachments.keys() {
        println!("{}  attachment: {}", indent, name);
    }
    if !entry.history.is_empty() {
        println!("{}  history: {} revisions", indent, entry.history.len());
    }
}
