mod scenario;

mod test_redirect;
