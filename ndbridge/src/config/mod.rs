mod parse;

pub(crate) use self::parse::parse_opts;
